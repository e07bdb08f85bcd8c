use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Binding between a logical path from files.db and the concrete path the
/// payload lives at on disk. The logical side is authoritative; the real
/// side is a case-obfuscated alias resolved during linking.
#[derive(Debug, Clone)]
pub struct Junction {
	logical: PathBuf,
	real: Option<PathBuf>,
}

impl Junction {
	pub fn new(logical: PathBuf) -> Self {
		Self { logical, real: None }
	}

	pub fn logical(&self) -> &Path {
		&self.logical
	}

	pub fn real(&self) -> Result<&Path> {
		self.real
			.as_deref()
			.ok_or_else(|| Error::PathUnresolved(self.logical.display().to_string()))
	}

	pub fn link_to_real(&mut self, real: PathBuf) {
		self.real = Some(real);
	}

	/// Case-folded comparison key. Virtual names in files.db do not have to
	/// match the on-disk case, so both sides fold to the same form.
	pub fn fold_key(&self) -> String {
		fold_path(&self.logical)
	}

	pub fn real_size(&self) -> Result<u64> {
		Ok(fs::metadata(self.real()?)?.len())
	}

	pub fn open_real(&self) -> Result<File> {
		Ok(File::open(self.real()?)?)
	}

	fn dest_path(&self, source_root: &Path, dest_root: &Path) -> Result<PathBuf> {
		let relative = self
			.real()?
			.strip_prefix(source_root)
			.map_err(|_| Error::PathUnresolved(self.logical.display().to_string()))?;
		Ok(dest_root.join(relative))
	}

	/// Create this directory (and any missing parents) inside the
	/// destination root.
	pub fn create_dest_directory(&self, source_root: &Path, dest_root: &Path) -> Result<PathBuf> {
		let path = self.dest_path(source_root, dest_root)?;
		fs::create_dir_all(&path)?;
		Ok(path)
	}

	/// Create the destination file with its parent directories and return it
	/// open for writing.
	pub fn create_dest_file(&self, source_root: &Path, dest_root: &Path) -> Result<(PathBuf, File)> {
		let path = self.dest_path(source_root, dest_root)?;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		Ok((path.clone(), File::create(&path)?))
	}

	/// Copy the real file into the destination tree and trim it to the
	/// logical size from files.db.
	pub fn copy_to_dest(&self, source_root: &Path, dest_root: &Path, size: u64) -> Result<PathBuf> {
		let path = self.dest_path(source_root, dest_root)?;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		fs::copy(self.real()?, &path)?;
		let file = fs::OpenOptions::new().write(true).open(&path)?;
		file.set_len(size)?;
		Ok(path)
	}
}

/// Platform-neutral, case-folded form of a path used for all logical/real
/// comparisons.
pub fn fold_path(path: &Path) -> String {
	path.to_string_lossy().replace('\\', "/").to_uppercase()
}

/// Enumerate every file and directory under `root` that belongs to the
/// protected payload. Skips the metadata directory itself, the package
/// staging area and any nested image root (a non-root `sce_sys` directory
/// carrying its own keystone).
pub fn enumerate_tree(root: &Path) -> Result<(BTreeSet<PathBuf>, BTreeSet<PathBuf>)> {
	let mut files = BTreeSet::new();
	let mut directories = BTreeSet::new();
	walk(root, root, &mut files, &mut directories)?;
	Ok((files, directories))
}

fn walk(
	root: &Path,
	dir: &Path,
	files: &mut BTreeSet<PathBuf>,
	directories: &mut BTreeSet<PathBuf>,
) -> Result<()> {
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let path = entry.path();
		let name = entry.file_name();

		if path.is_dir() {
			if name == "sce_pfs" {
				continue;
			}
			if path == root.join("sce_sys").join("package") {
				continue;
			}
			if name == "sce_sys" && path != root.join("sce_sys") && path.join("keystone").is_file() {
				continue;
			}
			directories.insert(path.clone());
			walk(root, &path, files, directories)?;
		} else {
			files.insert(path);
		}
	}
	Ok(())
}
