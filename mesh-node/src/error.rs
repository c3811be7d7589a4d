use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("certificate pin store error: {0}")]
    Pins(#[from] mesh_identity::pins::PinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
