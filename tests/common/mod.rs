//! Synthetic image builder for the end-to-end tests: given a manifest of
//! directories and files it emits a complete valid image — payload files,
//! a files.db with a correct hash tree, a unified or split integrity
//! database and a keystone — using the library's own crypto and derivation
//! modules so the two sides cannot drift apart.

use binrw::BinWriterExt;
use pfsdump::crypto::{CryptoProvider, SoftwareCryptoProvider, ICV_SIZE};
use pfsdump::filesdb::{
	calculate_node_icv, Block, BlockHeader, BlockType, FileInfo, FileRecord, FileType, ImageSpec,
	PfsHeader, EXPECTED_BT_ORDER, EXPECTED_PAGE_SIZE, FILES_DB_MAGIC, INVALID_FILE_INDEX,
	MAX_FILES_IN_BLOCK,
};
use pfsdump::integrity::{internal_node_count, SplitTableHeader, UnifiedDbHeader, UnifiedTableHeader, UNIFIED_DB_BLOCK_SIZE};
use pfsdump::keys::NativeKeyEncryptor;
use pfsdump::keystone::{keystone_digest, Keystone, KEYSTONE_MAGIC};
use pfsdump::secret::{self, CipherMode, SELECTOR_FILES_DB, SELECTOR_TABLE};
use pfsdump::Klicensee;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const TEST_KLICENSEE: Klicensee = [
	0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
];

const FILES_SALT: [u8; 16] = [0x11; 16];
const KEYSTONE_SALT: [u8; 16] = [0x33; 16];
const ROOT_HASHES_OFFSET: u64 = 0xF38;

struct FileSpec {
	rel_path: String,
	content: Vec<u8>,
	file_type: FileType,
}

pub struct ImageBuilder {
	root: PathBuf,
	image_spec: ImageSpec,
	klicensee: Klicensee,
	sector_size: u32,
	arity: u32,
	dirs: BTreeSet<String>,
	files: Vec<FileSpec>,
	bad_block: bool,
	obfuscate_case: bool,
}

/// Per-file layout decided before any crypto runs: the table salt and the
/// sector geometry.
struct TablePlan {
	icv_salt: u32,
	n_sectors: u32,
}

struct BuiltTable {
	icv_salt: u32,
	n_sectors: u32,
	signature: [u8; ICV_SIZE],
	leaves: Vec<[u8; ICV_SIZE]>,
	nodes: Vec<[u8; ICV_SIZE]>,
}

impl ImageBuilder {
	pub fn new(root: impl Into<PathBuf>, image_spec: ImageSpec) -> Self {
		let crypto = SoftwareCryptoProvider;
		let keyenc = NativeKeyEncryptor::new(&crypto);
		let keystone = build_keystone(&crypto, &keyenc, &TEST_KLICENSEE);

		// The keystone always exists; its content proves the klicensee at
		// the end of a run.
		Self {
			root: root.into(),
			image_spec,
			klicensee: TEST_KLICENSEE,
			sector_size: 0x1000,
			arity: 32,
			dirs: BTreeSet::new(),
			files: vec![FileSpec {
				rel_path: "sce_sys/keystone".to_string(),
				content: keystone,
				file_type: FileType::UnencryptedSystemFileRo,
			}],
			bad_block: false,
			obfuscate_case: false,
		}
	}

	pub fn dir(mut self, rel_path: &str) -> Self {
		self.dirs.insert(rel_path.to_string());
		self
	}

	pub fn file(mut self, rel_path: &str, content: Vec<u8>) -> Self {
		self.files.push(FileSpec {
			rel_path: rel_path.to_string(),
			content,
			file_type: FileType::NormalFile,
		});
		self
	}

	pub fn unencrypted_file(mut self, rel_path: &str, content: Vec<u8>) -> Self {
		self.files.push(FileSpec {
			rel_path: rel_path.to_string(),
			content,
			file_type: FileType::UnencryptedSystemFileRo,
		});
		self
	}

	pub fn empty_file(mut self, rel_path: &str) -> Self {
		self.files.push(FileSpec {
			rel_path: rel_path.to_string(),
			content: Vec::new(),
			file_type: FileType::NormalFile,
		});
		self
	}

	/// Append a block whose slot count is out of range, the way one damaged
	/// retail image does.
	pub fn bad_block(mut self) -> Self {
		self.bad_block = true;
		self
	}

	/// Store payload paths with swapped letter case, exercising the
	/// case-insensitive link step.
	pub fn obfuscate_case(mut self) -> Self {
		self.obfuscate_case = true;
		self
	}

	/// Logical relative path → plaintext content for every file the
	/// extraction is expected to emit, keyed by the on-disk spelling.
	pub fn expected_files(&self) -> Vec<(PathBuf, Vec<u8>)> {
		self.files
			.iter()
			.map(|f| (PathBuf::from(self.disk_rel(&f.rel_path)), f.content.clone()))
			.collect()
	}

	/// On-disk spelling of a logical path. The system directory keeps its
	/// exact name; everything else may be stored with obfuscated case.
	fn disk_rel(&self, rel_path: &str) -> String {
		if self.obfuscate_case && !rel_path.starts_with("sce_sys") {
			swap_case(rel_path)
		} else {
			rel_path.to_string()
		}
	}

	pub fn build(mut self) -> std::io::Result<()> {
		let crypto = SoftwareCryptoProvider;
		let keyenc = NativeKeyEncryptor::new(&crypto);

		// Every ancestor directory is an entry of its own.
		let mut ancestors = BTreeSet::new();
		for rel in self.files.iter().map(|f| f.rel_path.as_str()).chain(self.dirs.iter().map(String::as_str)) {
			let mut path = Path::new(rel);
			while let Some(parent) = path.parent() {
				if !parent.as_os_str().is_empty() {
					ancestors.insert(parent.to_string_lossy().into_owned());
				}
				path = parent;
			}
		}
		self.dirs.extend(ancestors);

		// Entry indices: directories first, then files, root directory is 0.
		let dirs: Vec<String> = self.dirs.iter().cloned().collect();
		let mut index_of: BTreeMap<&str, u32> = BTreeMap::new();
		for (i, dir) in dirs.iter().enumerate() {
			index_of.insert(dir, i as u32 + 1);
		}
		let first_file_index = dirs.len() as u32 + 1;

		let parent_of = |rel: &str| -> u32 {
			match Path::new(rel).parent() {
				Some(p) if !p.as_os_str().is_empty() => index_of[p.to_string_lossy().as_ref()],
				_ => 0,
			}
		};

		// Table plans fix each salt before any ICV is computed.
		let plans = self.plan_tables(&crypto);

		// Payload files and their integrity tables.
		let mut tables = Vec::new();
		for (i, (file, plan)) in self.files.iter().zip(&plans).enumerate() {
			let idx = first_file_index + i as u32;
			tables.push(self.emit_payload(&crypto, &keyenc, file, plan, idx)?);
		}

		// Directories on disk.
		for dir in &dirs {
			fs::create_dir_all(self.root.join(self.disk_rel(dir)))?;
		}

		self.emit_integrity_db(&tables)?;
		self.emit_files_db(&crypto, &keyenc, &dirs, first_file_index, &parent_of)?;
		Ok(())
	}

	fn plan_tables(&self, crypto: &SoftwareCryptoProvider) -> Vec<TablePlan> {
		let mut plans = Vec::new();
		let mut used_salts = BTreeSet::new();
		let mut unified_offset = UNIFIED_DB_BLOCK_SIZE as u64;

		for file in &self.files {
			let n_sectors = (file.content.len() as u64).div_ceil(self.sector_size as u64) as u32;
			let icv_salt = if self.image_spec.uses_unified_db() {
				let salt = (unified_offset / UNIFIED_DB_BLOCK_SIZE as u64) as u32;
				let body = 0x34 + ICV_SIZE as u64
					* (n_sectors + internal_node_count(n_sectors, self.arity)) as u64;
				unified_offset =
					(unified_offset + body).div_ceil(UNIFIED_DB_BLOCK_SIZE as u64) * UNIFIED_DB_BLOCK_SIZE as u64;
				salt
			} else {
				let digest = crypto
					.sha1(self.disk_rel(&file.rel_path).to_uppercase().as_bytes())
					.expect("sha1 is infallible");
				let mut salt = u32::from_be_bytes(digest[..4].try_into().unwrap());
				while !used_salts.insert(salt) {
					salt = salt.wrapping_add(1);
				}
				salt
			};
			plans.push(TablePlan { icv_salt, n_sectors });
		}
		plans
	}

	/// Write one payload file to disk (encrypting when its type calls for
	/// it) and produce the matching integrity table.
	fn emit_payload(
		&self,
		crypto: &SoftwareCryptoProvider,
		keyenc: &NativeKeyEncryptor,
		file: &FileSpec,
		plan: &TablePlan,
		idx: u32,
	) -> std::io::Result<BuiltTable> {
		let engine = self.image_spec.engine();
		let encrypted = file.file_type.is_encrypted();

		let mut stored = file.content.clone();
		if encrypted {
			stored.resize(plan.n_sectors as usize * self.sector_size as usize, 0);
		}

		let mut leaves = Vec::new();
		for (sector, chunk) in stored.chunks_mut(self.sector_size as usize).enumerate() {
			let keys = secret::sector_keys(
				crypto,
				keyenc,
				&self.klicensee,
				&file_salt_of(idx),
				&file_iv_of(idx),
				engine,
				plan.icv_salt,
				sector as u64,
			)
			.expect("sector key derivation");
			leaves.push(crypto.hmac_sha1(chunk, &keys.mac_key).expect("leaf icv"));

			if encrypted {
				let mut iv = keys.iv;
				match engine.mode {
					CipherMode::Cbc => crypto.aes_cbc_encrypt(chunk, &keys.key, &mut iv),
					CipherMode::Ctr => crypto.aes_ctr_encrypt(chunk, &keys.key, &mut iv),
					CipherMode::Ecb => crypto.aes_ecb_encrypt(chunk, &keys.key),
				}
				.expect("sector encryption");
			}
		}

		let table_secret = secret::get_secret(
			crypto,
			keyenc,
			&self.klicensee,
			&file_salt_of(idx),
			engine,
			plan.icv_salt,
			SELECTOR_TABLE,
			0,
		)
		.expect("table secret");

		let mut nodes = Vec::new();
		let mut level = leaves.clone();
		while level.len() > self.arity as usize {
			let mut next = Vec::new();
			for group in level.chunks(self.arity as usize) {
				next.push(crypto.hmac_sha1(&group.concat(), &table_secret).expect("node icv"));
			}
			nodes.extend_from_slice(&next);
			level = next;
		}
		let signature = match leaves.len() {
			0 => [0u8; ICV_SIZE],
			1 => leaves[0],
			_ => crypto.hmac_sha1(&level.concat(), &table_secret).expect("root icv"),
		};

		let disk_path = self.root.join(self.disk_rel(&file.rel_path));
		if let Some(parent) = disk_path.parent() {
			fs::create_dir_all(parent)?;
		}
		fs::write(disk_path, &stored)?;

		Ok(BuiltTable { icv_salt: plan.icv_salt, n_sectors: plan.n_sectors, signature, leaves, nodes })
	}

	fn emit_integrity_db(&self, tables: &[BuiltTable]) -> std::io::Result<()> {
		let pfs_dir = self.root.join("sce_pfs");
		fs::create_dir_all(&pfs_dir)?;

		if self.image_spec.uses_unified_db() {
			let mut body = Vec::new();
			for table in tables {
				let offset = table.icv_salt as u64 * UNIFIED_DB_BLOCK_SIZE as u64
					- UNIFIED_DB_BLOCK_SIZE as u64;
				body.resize(offset as usize, 0);

				let mut chunk = Cursor::new(Vec::new());
				chunk
					.write_le(&UnifiedTableHeader {
						version: 2,
						page_size: UNIFIED_DB_BLOCK_SIZE,
						bt_order: self.arity,
						n_sectors: table.n_sectors,
						sector_size: self.sector_size,
						padding: 0,
						signature: table.signature,
					})
					.expect("table header");
				body.extend_from_slice(&chunk.into_inner());
				for icv in table.leaves.iter().chain(&table.nodes) {
					body.extend_from_slice(icv);
				}
			}
			// Pad the body out to a whole number of database pages.
			let padded = (body.len() as u64).div_ceil(UNIFIED_DB_BLOCK_SIZE as u64)
				* UNIFIED_DB_BLOCK_SIZE as u64;
			body.resize(padded as usize, 0);

			let mut db = Cursor::new(Vec::new());
			db.write_le(&UnifiedDbHeader {
				version: 2,
				block_size: UNIFIED_DB_BLOCK_SIZE,
				unk2: u32::MAX,
				unk3: u32::MAX,
				data_size: body.len() as u64,
			})
			.expect("db header");
			let mut raw = db.into_inner();
			raw.resize(UNIFIED_DB_BLOCK_SIZE as usize, 0);
			raw.extend_from_slice(&body);
			fs::write(pfs_dir.join("unicv.db"), raw)?;
		} else {
			let icv_dir = pfs_dir.join("icv.db");
			fs::create_dir_all(&icv_dir)?;
			for table in tables {
				let mut chunk = Cursor::new(Vec::new());
				chunk
					.write_le(&SplitTableHeader {
						version: 2,
						sector_size: self.sector_size,
						bt_order: self.arity,
						n_sectors: table.n_sectors,
						padding: 0,
						signature: table.signature,
					})
					.expect("table header");
				let mut raw = chunk.into_inner();
				for icv in table.leaves.iter().chain(&table.nodes) {
					raw.extend_from_slice(icv);
				}
				fs::write(icv_dir.join(format!("{:08x}", table.icv_salt)), raw)?;
			}
		}
		Ok(())
	}

	fn emit_files_db(
		&self,
		crypto: &SoftwareCryptoProvider,
		keyenc: &NativeKeyEncryptor,
		dirs: &[String],
		first_file_index: u32,
		parent_of: &dyn Fn(&str) -> u32,
	) -> std::io::Result<()> {
		let engine = self.image_spec.engine();
		let secret = secret::get_secret(
			crypto,
			keyenc,
			&self.klicensee,
			&FILES_SALT,
			engine,
			0,
			SELECTOR_FILES_DB,
			0,
		)
		.expect("files secret");

		// One slot per entry, directories first.
		let mut slots: Vec<(FileRecord, FileInfo)> = Vec::new();
		for (i, dir) in dirs.iter().enumerate() {
			let name = Path::new(dir).file_name().unwrap().to_string_lossy();
			slots.push((
				make_record(&name, parent_of(dir)),
				make_info(i as u32 + 1, FileType::NormalDirectory, 0),
			));
		}
		for (i, file) in self.files.iter().enumerate() {
			let idx = first_file_index + i as u32;
			let name = Path::new(&file.rel_path).file_name().unwrap().to_string_lossy();
			slots.push((
				make_record(&name, parent_of(&file.rel_path)),
				make_info(idx, file.file_type, file.content.len() as u64),
			));
		}

		// Lay the slots out over pages: one root, or children plus an empty
		// root carrying their page hashes.
		let chunks: Vec<&[(FileRecord, FileInfo)]> =
			slots.chunks(MAX_FILES_IN_BLOCK as usize).collect();
		let single_page = chunks.len() == 1 && !self.bad_block;

		let mut pages: Vec<Vec<u8>> = Vec::new();
		let root_page = if single_page {
			pages.push(serialize_block(INVALID_FILE_INDEX, BlockType::Root, chunks[0], &[]));
			0u32
		} else {
			let n_children = chunks.len() as u32 + if self.bad_block { 1 } else { 0 };
			let root = n_children;
			for chunk in &chunks {
				pages.push(serialize_block(root, BlockType::Child, chunk, &[]));
			}
			if self.bad_block {
				pages.push(serialize_bad_block(root));
			}
			let mut child_icvs = Vec::new();
			for raw in &pages {
				child_icvs
					.push(calculate_node_icv(crypto, &secret, BlockType::Child, raw).expect("node icv"));
			}
			pages.push(serialize_block(INVALID_FILE_INDEX, BlockType::Root, &[], &child_icvs));
			root
		};

		let root_icv = {
			let raw = &pages[root_page as usize];
			calculate_node_icv(crypto, &secret, BlockType::Root, raw).expect("root icv")
		};

		let mut header = PfsHeader {
			magic: FILES_DB_MAGIC,
			version: 5,
			image_spec: self.image_spec.to_raw(),
			key_id: 0,
			files_salt: FILES_SALT,
			tail_size: (pages.len() as u32) * EXPECTED_PAGE_SIZE,
			page_size: EXPECTED_PAGE_SIZE,
			bt_order: EXPECTED_BT_ORDER,
			root_icv_page_number: root_page,
			root_icv,
			header_icv: [0u8; ICV_SIZE],
			rsa_sig0: [0u8; 0x100],
			padding0: 0,
			unk6: 0x400,
			padding1: [0u8; 0x298],
		};

		let mut raw_header = Cursor::new(Vec::new());
		raw_header.write_le(&header).expect("header");
		let mut raw_header = raw_header.into_inner();
		header.header_icv =
			crypto.hmac_sha1(&raw_header[..0x160], &secret).expect("header icv");
		raw_header[0x48..0x5C].copy_from_slice(&header.header_icv);

		let mut db = raw_header;
		for page in &pages {
			db.extend_from_slice(page);
		}
		fs::write(self.root.join("sce_pfs").join("files.db"), db)?;
		Ok(())
	}
}

fn build_keystone(
	crypto: &SoftwareCryptoProvider,
	keyenc: &NativeKeyEncryptor,
	klicensee: &Klicensee,
) -> Vec<u8> {
	let keystone = Keystone {
		magic: KEYSTONE_MAGIC,
		version: 1,
		padding: [0u8; 20],
		salt: KEYSTONE_SALT,
		reserved: [0u8; 16],
		hmac: [0u8; 32],
	};
	let mut raw = Cursor::new(Vec::new());
	raw.write_le(&keystone).expect("keystone");
	let mut raw = raw.into_inner();
	let hmac = keystone_digest(crypto, keyenc, klicensee, &raw[..0x40], &keystone.salt)
		.expect("keystone digest");
	raw[0x40..].copy_from_slice(&hmac);
	raw
}

fn make_record(name: &str, parent_index: u32) -> FileRecord {
	let mut record = FileRecord { name: [0u8; 0x100], parent_index };
	record.name[..name.len()].copy_from_slice(name.as_bytes());
	record
}

fn make_info(idx: u32, file_type: FileType, size: u64) -> FileInfo {
	FileInfo {
		idx,
		file_type,
		padding0: 0,
		size,
		file_salt: file_salt_of(idx),
		file_iv: file_iv_of(idx),
		padding1: [0u8; 80],
	}
}

fn empty_slot() -> (FileRecord, FileInfo) {
	(
		FileRecord { name: [0u8; 0x100], parent_index: 0 },
		FileInfo {
			idx: 0,
			file_type: FileType::Unexisting,
			padding0: 0,
			size: 0,
			file_salt: [0u8; 16],
			file_iv: [0u8; 16],
			padding1: [0u8; 80],
		},
	)
}

fn file_salt_of(idx: u32) -> [u8; 16] {
	[0x40u8 ^ idx as u8; 16]
}

fn file_iv_of(idx: u32) -> [u8; 16] {
	[0x8Cu8 ^ idx as u8; 16]
}

fn serialize_block(
	parent_page_number: u32,
	block_type: BlockType,
	slots: &[(FileRecord, FileInfo)],
	child_icvs: &[[u8; ICV_SIZE]],
) -> Vec<u8> {
	assert!(slots.len() <= MAX_FILES_IN_BLOCK as usize);
	assert!(child_icvs.len() <= MAX_FILES_IN_BLOCK as usize);

	let mut records = Vec::new();
	let mut infos = Vec::new();
	for (record, info) in slots {
		records.push(record.clone());
		infos.push(info.clone());
	}
	while records.len() < MAX_FILES_IN_BLOCK as usize {
		let (record, info) = empty_slot();
		records.push(record);
		infos.push(info);
	}

	let mut hashes: Vec<[u8; ICV_SIZE]> = child_icvs.to_vec();
	hashes.resize(MAX_FILES_IN_BLOCK as usize, [0u8; ICV_SIZE]);

	let block = Block {
		header: BlockHeader {
			parent_page_number,
			block_type,
			padding: 0,
			n_files: slots.len() as u32,
		},
		records,
		infos,
		hashes,
	};

	let mut raw = Cursor::new(Vec::new());
	raw.write_le(&block).expect("block");
	let raw = raw.into_inner();
	assert_eq!(raw.len(), EXPECTED_PAGE_SIZE as usize);
	raw
}

/// A child page whose slot count is out of range and whose record area is
/// garbage; real images contain these and they must round-trip the hash
/// tree without contributing entries.
fn serialize_bad_block(parent_page_number: u32) -> Vec<u8> {
	let mut raw = serialize_block(parent_page_number, BlockType::Child, &[], &[]);
	raw[0x0C..0x10].copy_from_slice(&0x0Bu32.to_le_bytes());
	raw[0x10..0x20].fill(0xEE); // garbage records, skipped by the parser
	raw
}

// Tamper helpers for the negative scenarios. Each flips one byte at a named
// location inside the built image.

pub fn flip_header_icv_byte(root: &Path) -> std::io::Result<()> {
	flip_byte(&root.join("sce_pfs").join("files.db"), 0x48)
}

pub fn flip_root_hash_byte(root: &Path, slot: u32) -> std::io::Result<()> {
	let db_path = root.join("sce_pfs").join("files.db");
	let raw = fs::read(&db_path)?;
	let root_page = u32::from_le_bytes(raw[0x30..0x34].try_into().unwrap());
	let offset = 0x400
		+ root_page as u64 * EXPECTED_PAGE_SIZE as u64
		+ ROOT_HASHES_OFFSET
		+ slot as u64 * ICV_SIZE as u64;
	flip_byte(&db_path, offset)
}

pub fn flip_payload_byte(root: &Path, rel_path: &str, offset: u64) -> std::io::Result<()> {
	flip_byte(&root.join(rel_path), offset)
}

fn flip_byte(path: &Path, offset: u64) -> std::io::Result<()> {
	let mut raw = fs::read(path)?;
	raw[offset as usize] ^= 0x01;
	fs::write(path, raw)
}

/// Collect every file under `root` with its content, as root-relative paths.
pub fn collect_tree(root: &Path) -> std::io::Result<BTreeMap<PathBuf, Vec<u8>>> {
	let mut out = BTreeMap::new();
	let mut stack = vec![root.to_path_buf()];
	while let Some(dir) = stack.pop() {
		for entry in fs::read_dir(&dir)? {
			let entry = entry?;
			let path = entry.path();
			if path.is_dir() {
				stack.push(path);
			} else {
				out.insert(path.strip_prefix(root).unwrap().to_path_buf(), fs::read(&path)?);
			}
		}
	}
	Ok(out)
}

fn swap_case(text: &str) -> String {
	text.chars()
		.map(|c| {
			if c.is_ascii_lowercase() {
				c.to_ascii_uppercase()
			} else if c.is_ascii_uppercase() {
				c.to_ascii_lowercase()
			} else {
				c
			}
		})
		.collect()
}
