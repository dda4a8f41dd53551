use clap::Parser;
use std::time::Duration;

use crate::config::{ServeConfig, StoreConfig};
use crate::serving::LookupPath;

#[derive(Parser, Debug)]
#[command(name = "zipages")]
#[command(version)]
#[command(about = "Serve static-site files out of remote ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipages https://objects.example.com/pages index.html --prefix group/site/public/\n  \
  zipages -i https://objects.example.com/pages docs/ --project 7 --prefix g/p/public/\n  \
  zipages -v https://objects.example.com/pages / --prefix g/p/public/   list the archive")]
pub struct Cli {
    /// Base URL of the object store
    #[arg(value_name = "STORE_URL")]
    pub store_url: String,

    /// Path to serve, relative to the project
    #[arg(value_name = "PATH", default_value = "/")]
    pub path: String,

    /// Project id the archive index is cached under
    #[arg(long, default_value_t = 0)]
    pub project: u64,

    /// Object key prefix of the project's files
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Treat the project as access controlled (no caching headers)
    #[arg(long)]
    pub access_control: bool,

    /// Object name of the project archive
    #[arg(long, value_name = "NAME", default_value = "artifacts.zip")]
    pub archive_name: String,

    /// max-age advertised for public content, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 600)]
    pub max_age: u64,

    /// Longest a response may stall between reads, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Print response headers to stderr
    #[arg(short = 'i')]
    pub include_headers: bool,

    /// List archive entries (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List archive entries verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Quiet mode
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn lookup_path(&self) -> LookupPath {
        LookupPath::new(self.project, self.prefix.clone()).with_access_control(self.access_control)
    }

    pub fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            archive_name: self.archive_name.clone(),
            cache_max_age: Duration::from_secs(self.max_age),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            read_timeout: Duration::from_secs(self.timeout),
            ..StoreConfig::default()
        }
    }
}
