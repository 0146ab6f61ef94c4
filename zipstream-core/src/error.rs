use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZipStreamError {
    #[error("The archive {id}.zip does not exist")]
    NotFound { id: String },

    #[error("failed to launch archiver `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No .{extension} files to archive in {dir}")]
    NoMatchingFiles { dir: String, extension: String },

    #[error("download was interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("archiver exited with {}", exit_label(.code))]
    ArchiverExit { code: Option<i32> },

    #[error("Config error: {0}")]
    Config(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, ZipStreamError>;
