use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "crop-data-processor")]
pub struct Args {
    /// Address to bind the HTTP listener on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP listener on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Run the API surface without starting the periodic scheduler.
    #[arg(long, default_value_t = false)]
    pub no_scheduler: bool,
}
