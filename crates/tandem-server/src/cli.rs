use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tandem-server", about = "Tandem realtime chat gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tandem.toml")]
    pub config: String,

    /// Address to listen on (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}
