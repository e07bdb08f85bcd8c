pub mod crypto;
pub mod error;
pub mod filesdb;
pub mod filesystem;
pub mod integrity;
pub mod junction;
pub mod keys;
pub mod keystone;
pub mod mapper;
pub mod pfsfile;
pub mod progress;
pub mod secret;

use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::filesystem::PfsFilesystem;
use crate::keys::KeyEncryptor;
use std::path::{Path, PathBuf};

/// 16 byte per-title license key; the root of all derivation.
pub type Klicensee = [u8; 16];

/// Mount the protected image under `title_id_path`, emit its plaintext tree
/// into `dest_title_id_path` and run the final keystone check.
pub fn extract(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: Klicensee,
	title_id_path: &Path,
	dest_title_id_path: &Path,
	sequential: bool,
) -> Result<()> {
	let source = trim_root(title_id_path);
	let dest = trim_root(dest_title_id_path);

	let pfs = PfsFilesystem::new(crypto, keyenc, klicensee, &source);
	let mounted = pfs.mount()?;
	pfs.decrypt_files(&mounted, &dest, sequential)?;

	keystone::verify_keystone(crypto, keyenc, &klicensee, &dest)?;
	keys::log_key_cache(keyenc);
	Ok(())
}

/// Strip trailing separators so destination mapping never sees an empty
/// final component.
fn trim_root(path: &Path) -> PathBuf {
	let text = path.to_string_lossy();
	let trimmed = text.trim_end_matches(['/', '\\']);
	if trimmed.is_empty() {
		path.to_path_buf()
	} else {
		PathBuf::from(trimmed)
	}
}
