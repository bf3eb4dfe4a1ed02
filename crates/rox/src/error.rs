use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoxError {
    #[error("flag name must not be empty")]
    EmptyFlagName,
    #[error("default value '{default}' is not one of the allowed options of flag '{name}'")]
    DefaultNotInOptions { name: String, default: String },
}
