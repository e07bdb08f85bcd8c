use thiserror::Error;

/// Flat error taxonomy for the whole extraction pipeline. The first error
/// aborts the current phase; warnings are logged and never surface here.
#[derive(Debug, Error)]
pub enum Error {
	#[error("i/o failure: {0}")]
	Io(#[from] std::io::Error),

	#[error("malformed image: {0}")]
	Format(String),

	#[error("header signature is invalid")]
	HeaderIcvInvalid,

	#[error("hash tree is invalid: {0}")]
	HashTreeInvalid(String),

	#[error("integrity check failed on sector {sector}")]
	SectorIcvInvalid { sector: u32 },

	#[error("merkle verification failed: {0}")]
	MerkleRootInvalid(String),

	#[error("index error: {0}")]
	IndexInvalid(String),

	#[error("path not resolved: {0}")]
	PathUnresolved(String),

	#[error("size mismatch: {0}")]
	SizeMismatch(String),

	#[error("page binding failed: {0}")]
	PageBindingFailed(String),

	#[error("crypto primitive failure")]
	CryptoFailure,

	#[error("no derived key known for seed {0}")]
	KeyUnknown(String),

	#[error("keystone verification failed: {0}")]
	KeystoneInvalid(String),

	#[error("aborted after a failure in another worker")]
	Aborted,
}

impl From<binrw::Error> for Error {
	fn from(err: binrw::Error) -> Self {
		match err {
			binrw::Error::Io(io) => Error::Io(io),
			other => Error::Format(other.to_string()),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
