use crate::crypto::{CryptoProvider, ICV_SIZE};
use crate::error::{Error, Result};
use crate::junction::{enumerate_tree, fold_path, Junction};
use crate::keys::KeyEncryptor;
use crate::secret::{self, CipherMode, CryptoEngine, SELECTOR_FILES_DB};
use binrw::{BinRead, BinReaderExt, BinWrite};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const FILES_DB_MAGIC: [u8; 8] = *b"NPD\0PFS\0";
pub const HEADER_SIZE: u64 = 0x400;
pub const EXPECTED_PAGE_SIZE: u32 = 0x1000;
pub const EXPECTED_BT_ORDER: u32 = 0x0A;
pub const MAX_FILES_IN_BLOCK: u32 = 10;
pub const INVALID_FILE_INDEX: u32 = 0xFFFF_FFFF;

/// Files are linked against the on-disk tree before the integrity database
/// is parsed, so the rounded-size check uses the expected sector size.
pub const EXPECTED_FILE_SECTOR_SIZE: u64 = 0x1000;

const BLOCK_HEADER_SIZE: u32 = 0x10;
const FILE_RECORD_SIZE: u32 = 0x104;
const FILE_INFO_SIZE: u32 = 0x80;
const HEADER_ICV_SPAN: usize = 0x160;
const HEADER_ICV_OFFSET: usize = 0x48;
const RSA_SIG0_OFFSET: usize = 0x5C;

/// Image mode from the files.db header. Decides the crypto engine behavior
/// and which integrity database layout the image carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSpec {
	Gamedata,
	Savedata,
	AcRoot,
	AcidDir,
}

impl ImageSpec {
	pub fn from_raw(raw: u32) -> Option<Self> {
		match raw {
			1 => Some(ImageSpec::Gamedata),
			2 => Some(ImageSpec::Savedata),
			3 => Some(ImageSpec::AcRoot),
			4 => Some(ImageSpec::AcidDir),
			_ => None,
		}
	}

	pub fn to_raw(self) -> u32 {
		match self {
			ImageSpec::Gamedata => 1,
			ImageSpec::Savedata => 2,
			ImageSpec::AcRoot => 3,
			ImageSpec::AcidDir => 4,
		}
	}

	/// Modes that store their integrity tables in the unified database.
	pub fn uses_unified_db(self) -> bool {
		matches!(self, ImageSpec::Gamedata | ImageSpec::AcRoot)
	}

	pub fn engine(self) -> CryptoEngine {
		match self {
			ImageSpec::Gamedata => CryptoEngine { keygen: true, mode: CipherMode::Cbc },
			ImageSpec::Savedata => CryptoEngine { keygen: false, mode: CipherMode::Cbc },
			ImageSpec::AcRoot => CryptoEngine { keygen: true, mode: CipherMode::Ctr },
			ImageSpec::AcidDir => CryptoEngine { keygen: false, mode: CipherMode::Ecb },
		}
	}
}

/// The 0x400 byte files.db header. Self-authenticating: the HMAC-SHA1 of the
/// first 0x160 bytes (with `header_icv` and `rsa_sig0` zeroed) under the
/// files secret must equal `header_icv`. `rsa_sig0` is a leftover signature
/// and is not verified here.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct PfsHeader {
	pub magic: [u8; 8],
	pub version: u32,
	pub image_spec: u32,
	pub key_id: u32,
	pub files_salt: [u8; 16],
	pub tail_size: u32,
	pub page_size: u32,
	pub bt_order: u32,
	pub root_icv_page_number: u32,
	pub root_icv: [u8; 20],
	pub header_icv: [u8; 20],
	pub rsa_sig0: [u8; 256],
	pub padding0: u32,
	pub unk6: u64,
	pub padding1: [u8; 0x298],
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little, repr = u32)]
pub enum BlockType {
	Child = 0,
	Root = 1,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct BlockHeader {
	pub parent_page_number: u32,
	pub block_type: BlockType,
	pub padding: u32,
	pub n_files: u32,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct FileRecord {
	pub name: [u8; 0x100],
	pub parent_index: u32,
}

impl FileRecord {
	/// Entry name as stored: NUL-terminated inside the fixed field.
	pub fn name_str(&self) -> String {
		let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
		String::from_utf8_lossy(&self.name[..end]).into_owned()
	}

	fn is_zero(&self) -> bool {
		self.parent_index == 0 && self.name.iter().all(|&b| b == 0)
	}
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[brw(little, repr = u16)]
#[strum(serialize_all = "snake_case")]
pub enum FileType {
	Unexisting = 0x0000,
	NormalFile = 0x0001,
	UnencryptedSystemFileRw = 0x0002,
	EncryptedSystemFileRw = 0x0003,
	UnencryptedSystemFileRo = 0x0004,
	EncryptedSystemFileRo = 0x0005,
	NormalDirectory = 0x8000,
	SysDirectory = 0x8001,
	AcidDirectory = 0x8002,
}

impl FileType {
	pub fn is_directory(self) -> bool {
		matches!(self, FileType::NormalDirectory | FileType::SysDirectory | FileType::AcidDirectory)
	}

	pub fn is_encrypted(self) -> bool {
		matches!(
			self,
			FileType::NormalFile | FileType::EncryptedSystemFileRw | FileType::EncryptedSystemFileRo
		)
	}

	pub fn is_unencrypted(self) -> bool {
		matches!(self, FileType::UnencryptedSystemFileRw | FileType::UnencryptedSystemFileRo)
	}

	pub fn is_unexisting(self) -> bool {
		self == FileType::Unexisting
	}
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct FileInfo {
	pub idx: u32,
	pub file_type: FileType,
	pub padding0: u16,
	pub size: u64,
	pub file_salt: [u8; 16],
	pub file_iv: [u8; 16],
	pub padding1: [u8; 80],
}

/// One page of the files.db tail. The three payload arrays always span all
/// ten slots; `n_files` says how many lead slots are live.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct Block {
	pub header: BlockHeader,
	#[br(count = MAX_FILES_IN_BLOCK as usize)]
	pub records: Vec<FileRecord>,
	#[br(count = MAX_FILES_IN_BLOCK as usize)]
	pub infos: Vec<FileInfo>,
	#[br(count = MAX_FILES_IN_BLOCK as usize)]
	pub hashes: Vec<[u8; ICV_SIZE]>,
}

/// One live slot pulled out of a block, with the block header and hash slot
/// it came from.
#[derive(Debug, Clone)]
pub struct FlatBlock {
	pub header: BlockHeader,
	pub record: FileRecord,
	pub info: FileInfo,
	pub hash: [u8; ICV_SIZE],
}

#[derive(Debug)]
pub struct FileEntry {
	pub junction: Junction,
	pub block: FlatBlock,
	pub ancestors: Vec<FlatBlock>,
}

#[derive(Debug)]
pub struct DirEntry {
	pub junction: Junction,
	pub block: FlatBlock,
	pub ancestors: Vec<FlatBlock>,
}

/// Fully parsed, validated and linked files.db.
pub struct FilesDb {
	pub header: PfsHeader,
	pub image_spec: ImageSpec,
	pub files: Vec<FileEntry>,
	pub dirs: Vec<DirEntry>,
}

impl FilesDb {
	pub fn engine(&self) -> CryptoEngine {
		self.image_spec.engine()
	}
}

/// Largest tree order a page can hold: a block header plus `order` record,
/// info and hash slots must fill the page exactly.
pub fn order_max_avail(page_size: u32) -> u32 {
	(page_size - BLOCK_HEADER_SIZE) / (FILE_RECORD_SIZE + FILE_INFO_SIZE + ICV_SIZE as u32)
}

/// Offset of tail page `page` inside files.db.
pub fn page_to_offset(page: u32, page_size: u32) -> u64 {
	HEADER_SIZE + page as u64 * page_size as u64
}

/// ICV of one tail page: HMAC-SHA1 over the raw page prefixed with the block
/// type tag, keyed with the files secret.
pub fn calculate_node_icv(
	crypto: &dyn CryptoProvider,
	secret: &[u8; ICV_SIZE],
	block_type: BlockType,
	raw_page: &[u8],
) -> Result<[u8; ICV_SIZE]> {
	let mut message = Vec::with_capacity(4 + raw_page.len());
	message.extend_from_slice(&(block_type as u32).to_le_bytes());
	message.extend_from_slice(raw_page);
	crypto.hmac_sha1(&message, secret)
}

struct PageIcv {
	page: u32,
	icv: [u8; ICV_SIZE],
}

pub struct FilesDbParser<'a> {
	crypto: &'a dyn CryptoProvider,
	keyenc: &'a dyn KeyEncryptor,
	klicensee: &'a [u8; 16],
	title_id_path: &'a Path,
}

impl<'a> FilesDbParser<'a> {
	pub fn new(
		crypto: &'a dyn CryptoProvider,
		keyenc: &'a dyn KeyEncryptor,
		klicensee: &'a [u8; 16],
		title_id_path: &'a Path,
	) -> Self {
		Self { crypto, keyenc, klicensee, title_id_path }
	}

	/// Parse files.db, validate the hash tree and link every entry to its
	/// on-disk counterpart.
	pub fn parse(&self) -> Result<FilesDb> {
		if !self.title_id_path.is_dir() {
			return Err(Error::PathUnresolved(format!(
				"root directory {} does not exist",
				self.title_id_path.display()
			)));
		}

		let db_path = self.title_id_path.join("sce_pfs").join("files.db");
		info!("parsing {}", db_path.display());
		let mut input = File::open(&db_path)?;

		let mut raw_header = [0u8; HEADER_SIZE as usize];
		input.read_exact(&mut raw_header)?;
		let header: PfsHeader = Cursor::new(&raw_header[..]).read_le()?;

		if header.magic != FILES_DB_MAGIC {
			return Err(Error::Format("magic word is incorrect".into()));
		}

		let image_spec = self.validate_image_spec(&header)?;
		let engine = image_spec.engine();

		let secret = secret::get_secret(
			self.crypto,
			self.keyenc,
			self.klicensee,
			&header.files_salt,
			engine,
			0,
			SELECTOR_FILES_DB,
			0,
		)?;

		let tail_len = input.seek(SeekFrom::End(0))? - HEADER_SIZE;
		validate_header(&header, tail_len)?;
		self.verify_header_icv(&mut input, &header, &raw_header, &secret)?;

		let (mut blocks, page_icvs) = self.read_blocks(&mut input, &header, &secret, tail_len)?;
		validate_hash_tree(&header, &blocks, &page_icvs)?;
		info!("hash tree is ok");

		let dir_matrix = construct_dir_matrix(&blocks)?;
		let file_matrix = construct_file_matrix(&mut blocks)?;
		let flat_blocks = flatten_blocks(&blocks)?;

		let mut dirs = construct_dir_entries(self.title_id_path, &dir_matrix, &flat_blocks)?;
		let mut files = construct_file_entries(self.title_id_path, &dir_matrix, &file_matrix, &flat_blocks)?;

		let (real_files, real_dirs) = enumerate_tree(self.title_id_path)?;
		link_dir_paths(&mut dirs, &real_dirs)?;
		link_file_paths(&mut files, &real_files)?;

		let num_extra = match_file_lists(&files, &real_files);

		let expected = (real_files.len() + real_dirs.len()) as i64 - num_extra as i64;
		if expected != flat_blocks.len() as i64 {
			return Err(Error::Format(format!(
				"{} files and directories on disk do not match {} entries in files.db",
				expected,
				flat_blocks.len()
			)));
		}

		Ok(FilesDb { header, image_spec, files, dirs })
	}

	/// The acceptable image specs depend on which integrity database variant
	/// is present next to files.db.
	fn validate_image_spec(&self, header: &PfsHeader) -> Result<ImageSpec> {
		let spec = ImageSpec::from_raw(header.image_spec)
			.ok_or_else(|| Error::Format(format!("invalid image spec {:#x}", header.image_spec)))?;

		let pfs_dir = self.title_id_path.join("sce_pfs");
		let unified = if pfs_dir.join("unicv.db").is_file() {
			true
		} else if pfs_dir.join("icv.db").is_dir() {
			false
		} else {
			return Err(Error::Format("failed to find unicv.db file or icv.db folder".into()));
		};

		if spec.uses_unified_db() != unified {
			return Err(Error::Format(format!(
				"image spec {:#x} does not match the {} integrity database",
				header.image_spec,
				if unified { "unified" } else { "split" }
			)));
		}
		Ok(spec)
	}

	fn verify_header_icv(
		&self,
		input: &mut File,
		header: &PfsHeader,
		raw_header: &[u8; HEADER_SIZE as usize],
		secret: &[u8; ICV_SIZE],
	) -> Result<()> {
		debug!("verifying header");

		let mut copy = *raw_header;
		copy[HEADER_ICV_OFFSET..HEADER_ICV_OFFSET + ICV_SIZE].fill(0);
		copy[RSA_SIG0_OFFSET..RSA_SIG0_OFFSET + 0x100].fill(0);

		let icv = self.crypto.hmac_sha1(&copy[..HEADER_ICV_SPAN], secret)?;
		if icv != header.header_icv {
			return Err(Error::HeaderIcvInvalid);
		}
		debug!("header signature is valid");

		// The stored root ICV must match the root page recomputed raw.
		let mut raw_page = vec![0u8; header.page_size as usize];
		input.seek(SeekFrom::Start(page_to_offset(header.root_icv_page_number, header.page_size)))?;
		input.read_exact(&mut raw_page)?;

		let root_header: BlockHeader = Cursor::new(&raw_page[..]).read_le()?;
		let root_icv = calculate_node_icv(self.crypto, secret, root_header.block_type, &raw_page)?;
		if root_icv != header.root_icv {
			return Err(Error::HashTreeInvalid("root icv is invalid".into()));
		}
		debug!("root icv is valid");
		Ok(())
	}

	fn read_blocks(
		&self,
		input: &mut File,
		header: &PfsHeader,
		secret: &[u8; ICV_SIZE],
		tail_len: u64,
	) -> Result<(Vec<Block>, BTreeMap<u32, Vec<PageIcv>>)> {
		let page_size = header.page_size as u64;
		let n_pages = (tail_len / page_size) as u32;

		let mut blocks = Vec::with_capacity(n_pages as usize);
		let mut page_icvs: BTreeMap<u32, Vec<PageIcv>> = BTreeMap::new();
		let mut raw_page = vec![0u8; header.page_size as usize];

		input.seek(SeekFrom::Start(HEADER_SIZE))?;
		for page in 0..n_pages {
			input.read_exact(&mut raw_page)?;

			let mut cursor = Cursor::new(&raw_page[..]);
			let mut block: Block = cursor.read_le()?;

			if block.header.padding != 0 {
				return Err(Error::Format(format!("unexpected padding in page {page}")));
			}

			// Blocks with an out-of-range slot count show up in the wild;
			// they still hash correctly but carry no usable slots.
			let mut is_bad_block = false;
			if block.header.n_files > MAX_FILES_IN_BLOCK {
				warn!("page {page}: slot count {} out of range, ignoring its records", block.header.n_files);
				block.header.n_files = 0;
				is_bad_block = true;
			}

			if !is_bad_block {
				for record in &block.records[block.header.n_files as usize..] {
					if !record.is_zero() {
						return Err(Error::Format(format!(
							"unexpected data in unused records of page {page}"
						)));
					}
				}
			}

			for info in &block.infos {
				if info.padding0 != 0 || info.padding1.iter().any(|&b| b != 0) {
					return Err(Error::Format(format!("unexpected padding in page {page} infos")));
				}
			}

			if cursor.position() != page_size {
				return Err(Error::Format(format!("page {page} overlays its neighbour")));
			}

			let icv = calculate_node_icv(self.crypto, secret, block.header.block_type, &raw_page)?;
			page_icvs
				.entry(block.header.parent_page_number)
				.or_default()
				.push(PageIcv { page, icv });
			blocks.push(block);
		}

		Ok((blocks, page_icvs))
	}
}

fn validate_header(header: &PfsHeader, tail_len: u64) -> Result<()> {
	if header.tail_size as u64 != tail_len {
		return Err(Error::Format("unexpected tail size".into()));
	}
	if !matches!(header.version, 3 | 4 | 5) {
		return Err(Error::Format(format!("invalid version {}", header.version)));
	}
	if header.key_id != 0 {
		return Err(Error::Format(format!("unexpected key id {}", header.key_id)));
	}
	if header.page_size != EXPECTED_PAGE_SIZE {
		return Err(Error::Format(format!("invalid page size {:#x}", header.page_size)));
	}
	if header.bt_order != order_max_avail(header.page_size) || header.bt_order != EXPECTED_BT_ORDER {
		return Err(Error::Format(format!("unexpected tree order {:#x}", header.bt_order)));
	}
	if header.unk6 != u64::MAX && header.unk6 != 0x400 {
		return Err(Error::Format(format!("unexpected unk6 {:#x}", header.unk6)));
	}
	if header.padding0 != 0 || header.padding1.iter().any(|&b| b != 0) {
		return Err(Error::Format("unexpected data instead of padding".into()));
	}
	if tail_len == 0 || tail_len % header.page_size as u64 != 0 {
		return Err(Error::Format("tail is not a whole number of pages".into()));
	}
	if page_to_offset(header.root_icv_page_number, header.page_size) >= HEADER_SIZE + tail_len {
		return Err(Error::Format("root page is out of range".into()));
	}
	Ok(())
}

/// Descend the hash tree from the root page. Every child page's ICV must sit
/// in its parent's hash slot at the child's position, and every parsed block
/// must be reachable exactly once.
fn validate_hash_tree(
	header: &PfsHeader,
	blocks: &[Block],
	page_icvs: &BTreeMap<u32, Vec<PageIcv>>,
) -> Result<()> {
	info!("validating hash tree");

	let roots = page_icvs.get(&INVALID_FILE_INDEX).map(Vec::as_slice).unwrap_or_default();
	let [root] = roots else {
		return Err(Error::HashTreeInvalid(format!("expected one root page, found {}", roots.len())));
	};
	if root.page != header.root_icv_page_number {
		return Err(Error::HashTreeInvalid(format!(
			"root page {} does not match header {}",
			root.page, header.root_icv_page_number
		)));
	}

	let mut visited = vec![false; blocks.len()];
	let mut stack = vec![root.page];
	while let Some(page) = stack.pop() {
		let slot = page as usize;
		if slot >= blocks.len() || std::mem::replace(&mut visited[slot], true) {
			return Err(Error::HashTreeInvalid(format!("page {page} revisited or out of range")));
		}

		let mut children: Vec<&PageIcv> =
			page_icvs.get(&page).map(|v| v.iter().collect()).unwrap_or_default();
		children.sort_by_key(|c| c.page);

		if children.len() > header.bt_order as usize {
			return Err(Error::HashTreeInvalid(format!("page {page} has too many children")));
		}
		for (i, child) in children.iter().enumerate() {
			if blocks[slot].hashes[i] != child.icv {
				return Err(Error::HashTreeInvalid(format!(
					"page {} icv does not match slot {} of page {}",
					child.page, i, page
				)));
			}
			stack.push(child.page);
		}
	}

	if let Some(page) = visited.iter().position(|&v| !v) {
		return Err(Error::HashTreeInvalid(format!("page {page} is not reachable from the root")));
	}
	Ok(())
}

/// Child index → parent index for every directory slot.
fn construct_dir_matrix(blocks: &[Block]) -> Result<BTreeMap<u32, u32>> {
	info!("building directory matrix");

	let mut matrix = BTreeMap::new();
	for block in blocks {
		for i in 0..block.header.n_files as usize {
			let info = &block.infos[i];
			if !info.file_type.is_directory() {
				continue;
			}
			let name = block.records[i].name_str();

			if info.size != 0 {
				warn!("directory {name} size is invalid");
			}
			if info.idx == INVALID_FILE_INDEX {
				return Err(Error::IndexInvalid(format!("directory {name} index is invalid")));
			}
			if matrix.insert(info.idx, block.records[i].parent_index).is_some() {
				return Err(Error::IndexInvalid(format!(
					"directory {name} index {} is not unique",
					info.idx
				)));
			}
		}
	}
	Ok(matrix)
}

/// Child index → parent index for every file slot. Repairs the type of
/// non-empty entries marked unexisting; empty unexisting slots are skipped
/// entirely.
fn construct_file_matrix(blocks: &mut [Block]) -> Result<BTreeMap<u32, u32>> {
	info!("building file matrix");

	let mut matrix = BTreeMap::new();
	for block in blocks {
		for i in 0..block.header.n_files as usize {
			if block.infos[i].file_type.is_directory() {
				continue;
			}
			let name = block.records[i].name_str();
			let parent = block.records[i].parent_index;
			let info = &mut block.infos[i];

			if info.size == 0 {
				if info.file_type.is_unexisting() {
					continue;
				}
				debug!("empty file {name} index {} of type {}", info.idx, info.file_type);
			} else if info.file_type.is_unexisting() {
				// Observed for entries outside sce_sys in split-database
				// images; they decrypt fine as regular files.
				warn!("invalid file type for file {name}, assuming the file is encrypted");
				info.file_type = FileType::NormalFile;
			}

			if info.idx == INVALID_FILE_INDEX {
				return Err(Error::IndexInvalid(format!("file {name} index is invalid")));
			}
			if matrix.insert(info.idx, parent).is_some() {
				return Err(Error::IndexInvalid(format!("file {name} index {} is not unique", info.idx)));
			}
		}
	}
	Ok(matrix)
}

/// One flat block per live slot.
fn flatten_blocks(blocks: &[Block]) -> Result<Vec<FlatBlock>> {
	info!("flattening file pages");

	let mut flat = Vec::new();
	for block in blocks {
		for i in 0..block.header.n_files as usize {
			let info = &block.infos[i];
			if info.file_type.is_unexisting() {
				if info.size == 0 {
					continue;
				}
				return Err(Error::Format(format!(
					"invalid file type for file {}",
					block.records[i].name_str()
				)));
			}
			flat.push(FlatBlock {
				header: block.header.clone(),
				record: block.records[i].clone(),
				info: info.clone(),
				hash: block.hashes[i],
			});
		}
	}
	Ok(flat)
}

fn find_flat_block(flat_blocks: &[FlatBlock], idx: u32, directory: bool) -> Option<&FlatBlock> {
	flat_blocks
		.iter()
		.find(|b| b.info.idx == idx && b.info.file_type.is_directory() == directory)
}

/// Walk the parent chain of `child` up to the root, returning the ancestor
/// directory blocks outermost-last.
fn ancestor_chain(
	dir_matrix: &BTreeMap<u32, u32>,
	flat_blocks: &[FlatBlock],
	mut parent: u32,
) -> Result<Vec<FlatBlock>> {
	let mut ancestors = Vec::new();
	while parent != 0 {
		if ancestors.len() > dir_matrix.len() {
			return Err(Error::IndexInvalid("directory chain does not terminate".into()));
		}
		let grandparent = *dir_matrix
			.get(&parent)
			.ok_or_else(|| Error::IndexInvalid(format!("missing parent directory index {parent}")))?;
		let block = find_flat_block(flat_blocks, parent, true)
			.ok_or_else(|| Error::IndexInvalid(format!("missing directory with index {parent}")))?;
		ancestors.push(block.clone());
		parent = grandparent;
	}
	Ok(ancestors)
}

fn assemble_path(title_id_path: &Path, ancestors: &[FlatBlock], name: &str) -> PathBuf {
	let mut path = title_id_path.to_path_buf();
	for ancestor in ancestors.iter().rev() {
		path.push(ancestor.record.name_str());
	}
	path.push(name);
	path
}

fn construct_dir_entries(
	title_id_path: &Path,
	dir_matrix: &BTreeMap<u32, u32>,
	flat_blocks: &[FlatBlock],
) -> Result<Vec<DirEntry>> {
	info!("building dir paths");

	let mut dirs = Vec::new();
	for (&child, &parent) in dir_matrix {
		let block = find_flat_block(flat_blocks, child, true)
			.ok_or_else(|| Error::IndexInvalid(format!("missing directory with index {child}")))?;
		let ancestors = ancestor_chain(dir_matrix, flat_blocks, parent)?;
		let path = assemble_path(title_id_path, &ancestors, &block.record.name_str());
		dirs.push(DirEntry { junction: Junction::new(path), block: block.clone(), ancestors });
	}
	Ok(dirs)
}

fn construct_file_entries(
	title_id_path: &Path,
	dir_matrix: &BTreeMap<u32, u32>,
	file_matrix: &BTreeMap<u32, u32>,
	flat_blocks: &[FlatBlock],
) -> Result<Vec<FileEntry>> {
	info!("building file paths");

	let mut files = Vec::new();
	for (&child, &parent) in file_matrix {
		let block = find_flat_block(flat_blocks, child, false)
			.ok_or_else(|| Error::IndexInvalid(format!("missing file with index {child}")))?;
		let ancestors = ancestor_chain(dir_matrix, flat_blocks, parent)?;
		let path = assemble_path(title_id_path, &ancestors, &block.record.name_str());
		files.push(FileEntry { junction: Junction::new(path), block: block.clone(), ancestors });
	}
	Ok(files)
}

/// Case-folded map of real paths, rejecting images whose on-disk layout
/// collides when folded.
fn fold_real_paths<'p>(
	paths: impl IntoIterator<Item = &'p PathBuf>,
	kind: &str,
) -> Result<BTreeMap<String, &'p PathBuf>> {
	let mut map = BTreeMap::new();
	for path in paths {
		if map.insert(fold_path(path), path).is_some() {
			return Err(Error::PathUnresolved(format!(
				"{kind} {} uppercase path matches another {kind}",
				path.display()
			)));
		}
	}
	Ok(map)
}

fn link_dir_paths(dirs: &mut [DirEntry], real_dirs: &std::collections::BTreeSet<PathBuf>) -> Result<()> {
	info!("linking dir paths");

	let real_map = fold_real_paths(real_dirs, "directory")?;
	for dir in dirs {
		let real = real_map.get(&dir.junction.fold_key()).ok_or_else(|| {
			Error::PathUnresolved(format!("directory {} does not exist", dir.junction.logical().display()))
		})?;
		dir.junction.link_to_real((*real).clone());
	}
	Ok(())
}

fn link_file_paths(files: &mut [FileEntry], real_files: &std::collections::BTreeSet<PathBuf>) -> Result<()> {
	info!("linking file paths");

	let real_map = fold_real_paths(real_files, "file")?;
	for file in files {
		let real = real_map.get(&file.junction.fold_key()).ok_or_else(|| {
			Error::PathUnresolved(format!("file {} does not exist", file.junction.logical().display()))
		})?;
		file.junction.link_to_real((*real).clone());

		// The stored file is either exactly the logical size or rounded up
		// to whole sectors.
		let size = file.junction.real_size()?;
		if size != file.block.info.size && size % EXPECTED_FILE_SECTOR_SIZE != 0 {
			return Err(Error::SizeMismatch(format!(
				"file {} size {} is incompatible with declared size {}",
				file.junction.logical().display(),
				size,
				file.block.info.size
			)));
		}
	}
	Ok(())
}

/// Report on-disk files that files.db does not know about. They are left
/// alone; the count feeds the final sanity check.
fn match_file_lists(files: &[FileEntry], real_files: &std::collections::BTreeSet<PathBuf>) -> usize {
	info!("matching file paths");

	let member_keys: std::collections::BTreeSet<String> =
		files.iter().map(|f| f.junction.fold_key()).collect();

	let mut num_extra = 0;
	for real in real_files {
		if !member_keys.contains(&fold_path(real)) {
			warn!("file {} is not present in files.db", real.display());
			num_extra += 1;
		}
	}
	num_extra
}
