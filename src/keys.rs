use crate::crypto::{CryptoProvider, KEY_SIZE};
use crate::error::{Error, Result};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Key used by the native variant to stand in for the device key-wrap
/// service. A real device answers the same queries through its secure
/// processor.
const SERVICE_MASTER_KEY: [u8; KEY_SIZE] = [
	0x6D, 0x2B, 0x97, 0xC6, 0x3F, 0x4C, 0x2A, 0x51, 0xD1, 0x80, 0x46, 0xEB, 0x0E, 0x95, 0x3C, 0xE4,
];

/// Wraps a 16 byte seed into a 16 byte device-bound derivative. Every key
/// used by the derivation pipelines goes through this capability first.
pub trait KeyEncryptor: Send + Sync {
	fn encrypt_key(&self, seed: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]>;

	/// Snapshot of every seed resolved so far, for the end-of-run report.
	fn cache(&self) -> Vec<([u8; KEY_SIZE], [u8; KEY_SIZE])>;
}

/// Dump the resolved seed table the way a run report expects it.
pub fn log_key_cache(keyenc: &dyn KeyEncryptor) {
	for (seed, drv) in keyenc.cache() {
		debug!("key cache: {}\t{}", hex::encode(seed), hex::encode(drv));
	}
}

/// Lookup-table variant: a flat text file of `hex(seed) hex(drv_key)` pairs,
/// loaded on first use. Seeds missing from the table are `KeyUnknown`.
pub struct FileKeyEncryptor {
	path: PathBuf,
	cache: Mutex<Option<BTreeMap<[u8; KEY_SIZE], [u8; KEY_SIZE]>>>,
}

impl FileKeyEncryptor {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), cache: Mutex::new(None) }
	}

	fn load_table(&self) -> Result<BTreeMap<[u8; KEY_SIZE], [u8; KEY_SIZE]>> {
		let mut table = BTreeMap::new();
		for (number, line) in fs::read_to_string(&self.path)?.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let mut fields = line.split_whitespace();
			let (seed, drv) = match (fields.next(), fields.next(), fields.next()) {
				(Some(seed), Some(drv), None) => (seed, drv),
				_ => {
					return Err(Error::Format(format!(
						"key list {}: malformed line {}",
						self.path.display(),
						number + 1
					)))
				}
			};
			table.insert(parse_key(seed)?, parse_key(drv)?);
		}
		Ok(table)
	}
}

impl KeyEncryptor for FileKeyEncryptor {
	fn encrypt_key(&self, seed: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]> {
		let mut cache = self.cache.lock().map_err(|_| Error::CryptoFailure)?;
		if cache.is_none() {
			*cache = Some(self.load_table()?);
		}
		match cache.as_ref().and_then(|table| table.get(seed)) {
			Some(drv) => Ok(*drv),
			None => Err(Error::KeyUnknown(hex::encode(seed))),
		}
	}

	fn cache(&self) -> Vec<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
		match self.cache.lock() {
			Ok(guard) => guard
				.as_ref()
				.map(|table| table.iter().map(|(k, v)| (*k, *v)).collect())
				.unwrap_or_default(),
			Err(_) => Vec::new(),
		}
	}
}

/// Native variant: runs the key-wrap algorithm locally with the crypto
/// provider, memoizing each answer.
pub struct NativeKeyEncryptor<'a> {
	crypto: &'a dyn CryptoProvider,
	cache: Mutex<BTreeMap<[u8; KEY_SIZE], [u8; KEY_SIZE]>>,
}

impl<'a> NativeKeyEncryptor<'a> {
	pub fn new(crypto: &'a dyn CryptoProvider) -> Self {
		Self { crypto, cache: Mutex::new(BTreeMap::new()) }
	}
}

impl KeyEncryptor for NativeKeyEncryptor<'_> {
	fn encrypt_key(&self, seed: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]> {
		if let Ok(cache) = self.cache.lock() {
			if let Some(drv) = cache.get(seed) {
				return Ok(*drv);
			}
		}
		let drv = self.crypto.aes_cmac(seed, &SERVICE_MASTER_KEY)?;
		if let Ok(mut cache) = self.cache.lock() {
			cache.insert(*seed, drv);
		}
		Ok(drv)
	}

	fn cache(&self) -> Vec<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
		match self.cache.lock() {
			Ok(cache) => cache.iter().map(|(k, v)| (*k, *v)).collect(),
			Err(_) => Vec::new(),
		}
	}
}

fn parse_key(text: &str) -> Result<[u8; KEY_SIZE]> {
	let bytes = hex::decode(text).map_err(|_| Error::Format(format!("bad hex key: {text}")))?;
	bytes
		.try_into()
		.map_err(|_| Error::Format(format!("key is not {KEY_SIZE} bytes: {text}")))
}
