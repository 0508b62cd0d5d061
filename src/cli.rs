use clap::Parser;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable detailed debug logging (global)
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Enable verbose logging (global)
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a suite from the config
    Run {
        /// Suite to run (see --list-suites)
        #[arg(short = 's', long)]
        suite: Option<String>,

        /// Path to the JSON config file
        #[arg(short = 'c', long, default_value = "scanflow.json")]
        config_file: String,

        /// Environment variable holding the whole config; overrides the file when set
        #[arg(short = 'e', long, default_value = "SCANFLOW_CONFIG")]
        config_variable: String,

        /// List the suites defined in the config and exit
        #[arg(short = 'l', long, default_value_t = false)]
        list_suites: bool,
    },

    /// Print a documented sample config covering every built-in module
    SampleConfig {
        /// Emit plain JSON without the inline comments
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Write to a file instead of stdout
        #[arg(short = 'o', long)]
        out: Option<String>,
    },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
