//! Utility functions for chainage arithmetic and linear referencing along polylines

use geo::{
    Closest, ClosestPoint, Coord, Distance, Euclidean, InterpolateLine, Length, LineLocatePoint,
    LineString, Point,
};

/// Tolerance used when snapping chainages to branch bounds and comparing locations
pub const CHAINAGE_EPSILON: f64 = 1e-7;

/// Tolerance used by the fully covered segmentation when checking branch ends
pub const FULL_COVERAGE_EPSILON: f64 = 1e-6;

/// Snap a chainage onto `[0, branch_length]`
///
/// Values within [`CHAINAGE_EPSILON`] of zero (or negative) become `0`, values within
/// epsilon of the branch length (or beyond it) become `branch_length`. Anything else is
/// returned unchanged. The upper bound wins on branches shorter than the epsilon, which
/// keeps the function idempotent.
#[inline]
pub fn snap_chainage(branch_length: f64, chainage: f64) -> f64 {
    let branch_length = branch_length.max(0.0);
    if chainage > branch_length - CHAINAGE_EPSILON {
        branch_length
    } else if chainage < CHAINAGE_EPSILON {
        0.0
    } else {
        chainage
    }
}

/// Linear interpolation through `(x0, y0)` and `(x1, y1)` evaluated at `x`
///
/// Degenerates to `y0` when both abscissae coincide.
#[inline]
pub fn interpolate_linear(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Convert a calculation chainage to a geometry chainage
///
/// Only branches with a custom length need the conversion; for the others both
/// chainages coincide.
#[inline]
pub fn map_chainage(length: f64, geometry_length: f64, is_length_custom: bool, chainage: f64) -> f64 {
    if !is_length_custom {
        return chainage;
    }
    if length <= 0.0 {
        return 0.0;
    }
    snap_chainage(geometry_length, chainage * geometry_length / length)
}

/// Convert a geometry chainage back to a calculation chainage
#[inline]
pub fn calculation_chainage(
    length: f64,
    geometry_length: f64,
    is_length_custom: bool,
    map_chainage: f64,
) -> f64 {
    if !is_length_custom {
        return map_chainage;
    }
    if geometry_length <= 0.0 {
        return 0.0;
    }
    snap_chainage(length, map_chainage * length / geometry_length)
}

/// Euclidean length of a polyline
#[inline]
pub fn polyline_length(line: &LineString<f64>) -> f64 {
    Euclidean.length(line)
}

/// Coordinate at `distance` along the polyline, clamped to its ends
///
/// Returns `None` for a polyline without coordinates.
pub fn point_along(line: &LineString<f64>, distance: f64) -> Option<Coord<f64>> {
    Euclidean
        .point_at_distance_from_start(line, distance)
        .map(Coord::from)
}

/// Extract the part of a polyline between two distances along it
///
/// When `to < from` the extracted line runs backwards, i.e. it starts at `from` and
/// its coordinates are reversed with respect to the source polyline.
pub fn sub_line(line: &LineString<f64>, from: f64, to: f64) -> LineString<f64> {
    if to < from {
        let mut coords = sub_line(line, to, from).0;
        coords.reverse();
        return LineString::new(coords);
    }

    let Some(start) = point_along(line, from) else {
        return LineString::new(Vec::new());
    };
    let mut coords = vec![start];

    // Inner vertices strictly between both distances
    let mut walked = 0.0;
    for segment in line.lines() {
        walked += Euclidean.length(&segment);
        if walked <= from {
            continue;
        }
        if walked >= to {
            break;
        }
        coords.push(segment.end);
    }

    if let Some(end) = point_along(line, to) {
        coords.push(end);
    }
    LineString::new(coords)
}

/// Concatenate two polylines, dropping the duplicated joint coordinate
pub fn concat_lines(first: &LineString<f64>, second: &LineString<f64>) -> LineString<f64> {
    let mut coords = first.0.clone();
    let mut rest = second.0.iter().copied().peekable();
    if let (Some(last), Some(next)) = (coords.last(), rest.peek())
        && Euclidean.distance(Point::from(*last), Point::from(*next)) < CHAINAGE_EPSILON
    {
        rest.next();
    }
    coords.extend(rest);
    LineString::new(coords)
}

/// Result of projecting a point onto a polyline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Distance along the polyline of the closest point
    pub along: f64,
    /// Distance between the projected point and the polyline
    pub offset: f64,
    /// The closest point on the polyline
    pub closest: Coord<f64>,
}

/// Project a coordinate onto a polyline
///
/// Returns `None` for a polyline without coordinates.
pub fn project_onto(line: &LineString<f64>, point: Coord<f64>) -> Option<Projection> {
    let first = *line.0.first()?;
    let point = Point::from(point);
    let closest = match line.closest_point(&point) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p,
        Closest::Indeterminate => Point::from(first),
    };
    let fraction = line.line_locate_point(&point)?;
    Some(Projection {
        along: fraction * polyline_length(line),
        offset: Euclidean.distance(closest, point),
        closest: closest.into(),
    })
}

/// Ratio between a new and an old length, `1` when the old length is zero
#[inline]
pub fn scale_factor(old_length: f64, new_length: f64) -> f64 {
    if old_length > 0.0 {
        new_length / old_length
    } else {
        1.0
    }
}
