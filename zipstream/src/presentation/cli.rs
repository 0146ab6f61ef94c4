use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use zipstream_core::Config;
use zipstream_core::config::DEFAULT_CHUNK_KIB;

#[derive(Parser)]
#[command(author, version, about = "zipstream: photo directories as streamed ZIP downloads", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that runs the archive pipeline.
#[derive(Args, Clone, Debug)]
pub struct PipelineArgs {
    /// Directory holding one sub-directory per archive
    #[arg(long, env = "ZIPSTREAM_ROOT", default_value = "./test_photos")]
    pub root: PathBuf,

    /// Relay chunk size in KiB
    #[arg(long = "chunk-kib", env = "ZIPSTREAM_CHUNK_KIB", default_value_t = DEFAULT_CHUNK_KIB)]
    pub chunk_kib: usize,

    /// Pause between chunks in seconds, e.g. 0.5
    #[arg(long, env = "ZIPSTREAM_DELAY")]
    pub delay: Option<f64>,

    /// Only archive files with this extension, directly under the directory
    #[arg(long, env = "ZIPSTREAM_EXTENSION")]
    pub extension: Option<String>,

    /// Archiver executable
    #[arg(long = "zip-program", env = "ZIPSTREAM_ZIP", default_value = "zip")]
    pub zip_program: PathBuf,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long = "log-level", env = "ZIPSTREAM_LOG", default_value = "info")]
    pub log_level: String,
}

impl PipelineArgs {
    pub fn to_config(&self) -> Config {
        Config {
            root: self.root.clone(),
            chunk_kib: self.chunk_kib,
            delay_secs: self.delay,
            extension: self.extension.clone(),
            log_level: self.log_level.clone(),
            zip_program: self.zip_program.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve archives over HTTP
    Serve {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Address to listen on
        #[arg(long, env = "ZIPSTREAM_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// HTML page served at `/`
        #[arg(long, env = "ZIPSTREAM_INDEX", default_value = "index.html")]
        index: PathBuf,
    },

    /// Write one archive to a file (or `-` for stdout) through the same pipeline
    Archive {
        /// Archive id, i.e. the directory name under the root
        id: String,

        #[arg(long, short, default_value = "-")]
        out: PathBuf,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}
