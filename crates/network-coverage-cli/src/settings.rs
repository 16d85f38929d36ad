use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// netcov - Build a chained network, fill a coverage and evaluate it along the chain
pub struct Settings {
    /// Number of branches in the chain
    #[clap(short, long, default_value = "4")]
    pub branches: usize,

    /// Length of every branch
    #[clap(short = 'l', long, default_value = "100.0")]
    pub branch_length: f64,

    /// Order number shared by all branches (-1 leaves them unordered)
    #[clap(short, long, default_value = "1", allow_negative_numbers = true)]
    pub order: i32,

    /// Evaluation points per branch
    #[clap(short, long, default_value = "5")]
    pub samples: usize,

    /// Split the first branch at this chainage and merge it back afterwards
    #[clap(long, value_name = "CHAINAGE")]
    pub split_at: Option<f64>,

    /// Value reported where the coverage has no data
    #[clap(short, long, default_value = "-999.0", allow_negative_numbers = true)]
    pub default_value: f64,
}

impl Settings {
    /// Parse from the command line, exiting with usage on error
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }
}
