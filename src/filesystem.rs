use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::filesdb::{FilesDb, FilesDbParser};
use crate::integrity::{IntegrityDb, IntegrityDbParser, IntegrityTable};
use crate::keys::KeyEncryptor;
use crate::mapper::{PageMap, PageMapper};
use crate::pfsfile::PfsFile;
use crate::progress::ProgressBar;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything mount produces. Read-only from here on; decryption only
/// consumes it.
pub struct Mounted {
	pub files_db: FilesDb,
	pub integrity_db: IntegrityDb,
	pub page_map: PageMap,
}

/// The protected filesystem as a whole: parse and cross-validate everything
/// under the title directory, then emit the plaintext tree.
pub struct PfsFilesystem<'a> {
	crypto: &'a dyn CryptoProvider,
	keyenc: &'a dyn KeyEncryptor,
	klicensee: [u8; 16],
	title_id_path: PathBuf,
}

impl<'a> PfsFilesystem<'a> {
	pub fn new(
		crypto: &'a dyn CryptoProvider,
		keyenc: &'a dyn KeyEncryptor,
		klicensee: [u8; 16],
		title_id_path: impl Into<PathBuf>,
	) -> Self {
		Self { crypto, keyenc, klicensee, title_id_path: title_id_path.into() }
	}

	/// Sequential pipeline: files.db, integrity database, page map. Nothing
	/// is mutated after this returns.
	pub fn mount(&self) -> Result<Mounted> {
		let files_db =
			FilesDbParser::new(self.crypto, self.keyenc, &self.klicensee, &self.title_id_path).parse()?;
		let integrity_db = IntegrityDbParser::new(&self.title_id_path).parse()?;
		let page_map = PageMapper::new(self.crypto, self.keyenc, &self.klicensee)
			.bruteforce_map(&files_db, &integrity_db)?;

		Ok(Mounted { files_db, integrity_db, page_map })
	}

	/// Mirror the tree into the destination: directories, empty files, then
	/// every integrity table's file — copied or decrypted. Tables are
	/// independent, so they run on the worker pool unless `sequential`.
	pub fn decrypt_files(&self, mounted: &Mounted, dest_root: &Path, sequential: bool) -> Result<()> {
		info!("creating directories");
		for dir in &mounted.files_db.dirs {
			let created = dir.junction.create_dest_directory(&self.title_id_path, dest_root)?;
			debug!("created {}", created.display());
		}

		info!("creating empty files");
		for &file_index in &mounted.page_map.empty_files {
			match mounted.files_db.files.get(file_index) {
				Some(file) => {
					let (created, _) = file.junction.create_dest_file(&self.title_id_path, dest_root)?;
					debug!("created {}", created.display());
				}
				None => warn!("ignored empty file entry {file_index}"),
			}
		}

		info!("decrypting files");
		let tables: Vec<&IntegrityTable> =
			mounted.integrity_db.tables.iter().filter(|t| t.n_sectors > 0).collect();
		let progress = ProgressBar::Decrypt.new(tables.len() as u64);
		let abort = AtomicBool::new(false);

		let process = |table: &IntegrityTable| -> Result<()> {
			if abort.load(Ordering::Relaxed) {
				return Err(Error::Aborted);
			}
			let outcome = self.process_table(mounted, table, dest_root, &abort);
			if outcome.is_err() {
				abort.store(true, Ordering::Relaxed);
			}
			progress(1);
			outcome
		};

		let results: Vec<Result<()>> = if sequential {
			tables.iter().map(|t| process(t)).collect()
		} else {
			tables.par_iter().map(|t| process(t)).collect()
		};

		// Workers that merely saw the abort flag report `Aborted`; keep the
		// error that tripped it as the overall result.
		let mut first_error: Option<Error> = None;
		for error in results.into_iter().filter_map(|r| r.err()) {
			warn!("{error}");
			let replace = match &first_error {
				None => true,
				Some(Error::Aborted) => !matches!(error, Error::Aborted),
				Some(_) => false,
			};
			if replace {
				first_error = Some(error);
			}
		}
		match first_error {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}

	/// Route one table's file: plaintext files are copied and trimmed,
	/// protected files go through the sector decryptor.
	fn process_table(
		&self,
		mounted: &Mounted,
		table: &IntegrityTable,
		dest_root: &Path,
		abort: &AtomicBool,
	) -> Result<()> {
		let file_index = *mounted.page_map.bindings.get(&table.icv_salt).ok_or_else(|| {
			Error::PageBindingFailed(format!("table {:#x} is not in the page map", table.icv_salt))
		})?;
		let file = mounted.files_db.files.get(file_index).ok_or_else(|| {
			Error::PageBindingFailed(format!("table {:#x} binds a missing file", table.icv_salt))
		})?;

		let file_type = file.block.info.file_type;
		if file_type.is_directory() || file_type.is_unexisting() {
			return Err(Error::PageBindingFailed(format!(
				"table {:#x} binds an entry of type {file_type}",
				table.icv_salt
			)));
		}

		if file_type.is_unencrypted() {
			file.junction.copy_to_dest(&self.title_id_path, dest_root, file.block.info.size)?;
			info!("copied {}", file.junction.logical().display());
		} else {
			PfsFile::new(self.crypto, self.keyenc, &self.klicensee, mounted.files_db.engine(), file, table)
				.decrypt_to(&self.title_id_path, dest_root, abort)?;
			info!("decrypted {}", file.junction.logical().display());
		}
		Ok(())
	}
}
