use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::filesdb::FileEntry;
use crate::integrity::{verify_merkle, IntegrityTable};
use crate::keys::KeyEncryptor;
use crate::secret::{self, CipherMode, CryptoEngine, SELECTOR_TABLE};
use log::trace;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Decrypts one protected file sector by sector, verifying every leaf ICV
/// and then the table's Merkle tree. Sectors are processed strictly in
/// order; the abort flag is checked between sectors so a failure elsewhere
/// stops long files early.
pub struct PfsFile<'a> {
	crypto: &'a dyn CryptoProvider,
	keyenc: &'a dyn KeyEncryptor,
	klicensee: &'a [u8; 16],
	engine: CryptoEngine,
	file: &'a FileEntry,
	table: &'a IntegrityTable,
}

impl<'a> PfsFile<'a> {
	pub fn new(
		crypto: &'a dyn CryptoProvider,
		keyenc: &'a dyn KeyEncryptor,
		klicensee: &'a [u8; 16],
		engine: CryptoEngine,
		file: &'a FileEntry,
		table: &'a IntegrityTable,
	) -> Self {
		Self { crypto, keyenc, klicensee, engine, file, table }
	}

	/// Emit the plaintext file into the destination tree, trimmed to its
	/// logical size.
	pub fn decrypt_to(&self, source_root: &Path, dest_root: &Path, abort: &AtomicBool) -> Result<()> {
		let logical_size = self.file.block.info.size;
		let disk_size = self.file.junction.real_size()?;
		let sector_size = self.table.sector_size as u64;

		let mut input = self.file.junction.open_real()?;
		let (dest_path, mut output) = self.file.junction.create_dest_file(source_root, dest_root)?;
		trace!("decrypting into {}", dest_path.display());

		let mut remaining = logical_size;
		for sector in 0..self.table.n_sectors {
			if abort.load(Ordering::Relaxed) {
				return Err(Error::Aborted);
			}

			let offset = sector as u64 * sector_size;
			let len = sector_size.min(disk_size - offset) as usize;
			let mut data = vec![0u8; len];
			input.read_exact(&mut data)?;

			let keys = secret::sector_keys(
				self.crypto,
				self.keyenc,
				self.klicensee,
				&self.file.block.info.file_salt,
				&self.file.block.info.file_iv,
				self.engine,
				self.table.icv_salt,
				sector as u64,
			)?;

			let mut iv = keys.iv;
			match self.engine.mode {
				CipherMode::Cbc => self.crypto.aes_cbc_decrypt(&mut data, &keys.key, &mut iv)?,
				CipherMode::Ctr => self.crypto.aes_ctr_decrypt(&mut data, &keys.key, &mut iv)?,
				CipherMode::Ecb => self.crypto.aes_ecb_decrypt(&mut data, &keys.key)?,
			}

			let icv = self.crypto.hmac_sha1(&data, &keys.mac_key)?;
			if self.table.leaves.get(sector as usize) != Some(&icv) {
				return Err(Error::SectorIcvInvalid { sector });
			}

			// The final sector may carry padding past the logical size.
			let take = remaining.min(len as u64) as usize;
			output.write_all(&data[..take])?;
			remaining -= take as u64;
		}

		let table_secret = secret::get_secret(
			self.crypto,
			self.keyenc,
			self.klicensee,
			&self.file.block.info.file_salt,
			self.engine,
			self.table.icv_salt,
			SELECTOR_TABLE,
			0,
		)?;
		verify_merkle(self.crypto, self.table, &table_secret)?;

		Ok(())
	}
}
