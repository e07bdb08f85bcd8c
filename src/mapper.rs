use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::filesdb::{FileEntry, FilesDb};
use crate::integrity::{IntegrityDb, IntegrityTable};
use crate::keys::KeyEncryptor;
use crate::progress::ProgressBar;
use crate::secret::{self, CipherMode, CryptoEngine};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

/// Result of the brute-force pass: which file each integrity table protects,
/// and the set of files that have no sectors at all.
pub struct PageMap {
	/// icv_salt → index into `FilesDb::files`.
	pub bindings: BTreeMap<u32, usize>,
	/// Indices of zero-length files; they never touch a table.
	pub empty_files: BTreeSet<usize>,
}

pub struct PageMapper<'a> {
	crypto: &'a dyn CryptoProvider,
	keyenc: &'a dyn KeyEncryptor,
	klicensee: &'a [u8; 16],
}

impl<'a> PageMapper<'a> {
	pub fn new(crypto: &'a dyn CryptoProvider, keyenc: &'a dyn KeyEncryptor, klicensee: &'a [u8; 16]) -> Self {
		Self { crypto, keyenc, klicensee }
	}

	/// The binding between tables and files is stored nowhere; recover it by
	/// testing each file's first sector ICV against every plausible table.
	pub fn bruteforce_map(&self, files_db: &FilesDb, integrity_db: &IntegrityDb) -> Result<PageMap> {
		info!("bruteforcing page map for {} files", files_db.files.len());

		let engine = files_db.engine();
		let mut bindings: BTreeMap<u32, usize> = BTreeMap::new();
		let mut bound_tables: BTreeMap<u32, usize> = BTreeMap::new();
		let mut empty_files = BTreeSet::new();

		let progress = ProgressBar::Map.new(files_db.files.len() as u64);

		for (file_index, file) in files_db.files.iter().enumerate() {
			if file.block.info.size == 0 {
				empty_files.insert(file_index);
				progress(1);
				continue;
			}

			let disk_size = file.junction.real_size()?;
			let mut matched = None;

			for table in &integrity_db.tables {
				if !candidate_for(table, file, disk_size) {
					continue;
				}
				if self.first_sector_matches(file, table, engine, disk_size)? {
					if let Some(&other) = bound_tables.get(&table.icv_salt) {
						return Err(Error::PageBindingFailed(format!(
							"table {:#x} matches both {} and {}",
							table.icv_salt,
							files_db.files[other].junction.logical().display(),
							file.junction.logical().display()
						)));
					}
					matched = Some(table.icv_salt);
					break;
				}
			}

			match matched {
				Some(icv_salt) => {
					debug!("bound table {:#x} to {}", icv_salt, file.junction.logical().display());
					bound_tables.insert(icv_salt, file_index);
					bindings.insert(icv_salt, file_index);
				}
				None => {
					return Err(Error::PageBindingFailed(format!(
						"no integrity table matches {}",
						file.junction.logical().display()
					)))
				}
			}
			progress(1);
		}

		info!("page map solved: {} bindings, {} empty files", bindings.len(), empty_files.len());
		Ok(PageMap { bindings, empty_files })
	}

	/// Decrypt (when needed) the file's first sector under the candidate
	/// table's salt and compare its ICV with the table's first leaf.
	fn first_sector_matches(
		&self,
		file: &FileEntry,
		table: &IntegrityTable,
		engine: CryptoEngine,
		disk_size: u64,
	) -> Result<bool> {
		let len = (table.sector_size as u64).min(disk_size) as usize;
		let mut sector = vec![0u8; len];
		let mut input = file.junction.open_real()?;
		input.read_exact(&mut sector)?;

		let keys = secret::sector_keys(
			self.crypto,
			self.keyenc,
			self.klicensee,
			&file.block.info.file_salt,
			&file.block.info.file_iv,
			engine,
			table.icv_salt,
			0,
		)?;

		if file.block.info.file_type.is_encrypted() {
			let mut iv = keys.iv;
			match engine.mode {
				CipherMode::Cbc => self.crypto.aes_cbc_decrypt(&mut sector, &keys.key, &mut iv)?,
				CipherMode::Ctr => self.crypto.aes_ctr_decrypt(&mut sector, &keys.key, &mut iv)?,
				CipherMode::Ecb => self.crypto.aes_ecb_decrypt(&mut sector, &keys.key)?,
			}
		}

		let icv = self.crypto.hmac_sha1(&sector, &keys.mac_key)?;
		Ok(table.leaves.first() == Some(&icv))
	}
}

/// Prefilter: the table must describe exactly this file's sector count, and
/// the stored size must be the logical size or whole sectors.
fn candidate_for(table: &IntegrityTable, file: &FileEntry, disk_size: u64) -> bool {
	if table.n_sectors == 0 || table.sector_size == 0 || !table.sector_size.is_power_of_two() {
		return false;
	}
	let logical = file.block.info.size;
	let sectors = logical.div_ceil(table.sector_size as u64);
	if sectors != table.n_sectors as u64 {
		return false;
	}
	disk_size == logical || disk_size == sectors * table.sector_size as u64
}
