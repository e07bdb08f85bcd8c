use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::keys::KeyEncryptor;
use crate::secret::{self, CryptoEngine, SELECTOR_KEYSTONE};
use binrw::{BinRead, BinReaderExt, BinWrite};
use log::info;
use std::io::Cursor;
use std::path::Path;

pub const KEYSTONE_MAGIC: [u8; 8] = *b"KEYSTONE";
pub const KEYSTONE_SIZE: usize = 0x60;

/// The small metadata file under sce_sys. Its trailing HMAC is keyed by a
/// klicensee-derived secret, which makes it the end-of-run proof that the
/// whole pipeline ran with the right license key.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct Keystone {
	pub magic: [u8; 8],
	pub version: u32,
	pub padding: [u8; 20],
	pub salt: [u8; 16],
	pub reserved: [u8; 16],
	pub hmac: [u8; 32],
}

/// HMAC over the keystone body under the klicensee-derived keystone secret.
pub fn keystone_digest(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: &[u8; 16],
	body: &[u8],
	salt: &[u8; 16],
) -> Result<[u8; 32]> {
	let secret = secret::get_secret(
		crypto,
		keyenc,
		klicensee,
		salt,
		CryptoEngine::PLAIN,
		0,
		SELECTOR_KEYSTONE,
		0,
	)?;
	crypto.hmac_sha256(body, &secret)
}

/// Re-derive the keystone secret from the decrypted destination tree and
/// check the stored tag.
pub fn verify_keystone(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: &[u8; 16],
	dest_root: &Path,
) -> Result<()> {
	info!("keystone sanity check");

	let path = dest_root.join("sce_sys").join("keystone");
	let raw = std::fs::read(&path)?;
	if raw.len() != KEYSTONE_SIZE {
		return Err(Error::KeystoneInvalid(format!("{} is {} bytes", path.display(), raw.len())));
	}

	let keystone: Keystone = Cursor::new(&raw[..]).read_le()?;
	if keystone.magic != KEYSTONE_MAGIC {
		return Err(Error::KeystoneInvalid("bad magic".into()));
	}
	if keystone.version != 1 {
		return Err(Error::KeystoneInvalid(format!("unexpected version {}", keystone.version)));
	}
	if keystone.padding.iter().any(|&b| b != 0) || keystone.reserved.iter().any(|&b| b != 0) {
		return Err(Error::KeystoneInvalid("unexpected data instead of padding".into()));
	}

	let expected = keystone_digest(crypto, keyenc, klicensee, &raw[..0x40], &keystone.salt)?;
	if expected != keystone.hmac {
		return Err(Error::KeystoneInvalid("stored tag does not match the derived secret".into()));
	}

	info!("keystone is ok");
	Ok(())
}
