use crate::crypto::{CryptoProvider, ICV_SIZE};
use crate::error::{Error, Result};
use binrw::{BinRead, BinReaderExt, BinWrite};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const UNIFIED_DB_MAGIC: [u8; 8] = *b"SCEIRODB";
pub const UNIFIED_TABLE_MAGIC: [u8; 8] = *b"SCEIFTBL";
pub const SPLIT_TABLE_MAGIC: [u8; 8] = *b"SCEICVDB";
pub const EXPECTED_DB_VERSION: u32 = 2;
pub const UNIFIED_DB_BLOCK_SIZE: u32 = 0x400;

/// How the image stores its per-file integrity tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbVariant {
	/// One `unicv.db` blob; tables are addressed by their page inside it.
	Unified,
	/// One file per table under `icv.db/`; the file name is the salt.
	Split,
}

/// Header of the unified database blob.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little, magic = b"SCEIRODB")]
pub struct UnifiedDbHeader {
	pub version: u32,
	pub block_size: u32,
	pub unk2: u32,
	pub unk3: u32,
	pub data_size: u64,
}

/// Header of one table chunk inside the unified database.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little, magic = b"SCEIFTBL")]
pub struct UnifiedTableHeader {
	pub version: u32,
	pub page_size: u32,
	pub bt_order: u32,
	pub n_sectors: u32,
	pub sector_size: u32,
	pub padding: u32,
	pub signature: [u8; ICV_SIZE],
}

/// Header of one per-asset file in the split database directory.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little, magic = b"SCEICVDB")]
pub struct SplitTableHeader {
	pub version: u32,
	pub sector_size: u32,
	pub bt_order: u32,
	pub n_sectors: u32,
	pub padding: u32,
	pub signature: [u8; ICV_SIZE],
}

/// One Merkle tree protecting one file's sectors. `icv_salt` is the table's
/// page number (unified) or name hash (split); the internal nodes are laid
/// out level by level with the leaf-adjacent level first, and the root lives
/// in `signature`.
#[derive(Debug, Clone)]
pub struct IntegrityTable {
	pub icv_salt: u32,
	pub n_sectors: u32,
	pub sector_size: u32,
	pub arity: u32,
	pub signature: [u8; ICV_SIZE],
	pub leaves: Vec<[u8; ICV_SIZE]>,
	pub nodes: Vec<[u8; ICV_SIZE]>,
}

pub struct IntegrityDb {
	pub variant: DbVariant,
	pub tables: Vec<IntegrityTable>,
}

/// Number of stored internal nodes for a tree of `n_sectors` leaves with the
/// given arity. Levels are stored only while the level below overflows the
/// arity; the root itself is always the header signature.
pub fn internal_node_count(n_sectors: u32, arity: u32) -> u32 {
	let mut count = 0;
	let mut level = n_sectors;
	while level > arity {
		level = level.div_ceil(arity);
		count += level;
	}
	count
}

/// Recompute the Merkle tree over `table.leaves`, comparing every stored
/// internal node and finally the root signature.
pub fn verify_merkle(crypto: &dyn CryptoProvider, table: &IntegrityTable, secret: &[u8; ICV_SIZE]) -> Result<()> {
	if table.n_sectors == 0 {
		return Ok(());
	}
	if table.n_sectors == 1 {
		if table.signature != table.leaves[0] {
			return Err(Error::MerkleRootInvalid(format!(
				"single-sector table {:#x} signature does not match its leaf",
				table.icv_salt
			)));
		}
		return Ok(());
	}

	let arity = table.arity as usize;
	let mut level = table.leaves.clone();
	let mut node_cursor = 0usize;

	while level.len() > arity {
		let mut next = Vec::with_capacity(level.len().div_ceil(arity));
		for group in level.chunks(arity) {
			next.push(crypto.hmac_sha1(&group.concat(), secret)?);
		}
		for (i, node) in next.iter().enumerate() {
			match table.nodes.get(node_cursor + i) {
				Some(stored) if stored == node => {}
				_ => {
					return Err(Error::MerkleRootInvalid(format!(
						"internal node {} of table {:#x} is invalid",
						node_cursor + i,
						table.icv_salt
					)))
				}
			}
		}
		node_cursor += next.len();
		level = next;
	}

	let root = crypto.hmac_sha1(&level.concat(), secret)?;
	if root != table.signature {
		return Err(Error::MerkleRootInvalid(format!(
			"root of table {:#x} does not match its signature",
			table.icv_salt
		)));
	}
	Ok(())
}

pub struct IntegrityDbParser<'a> {
	title_id_path: &'a Path,
}

impl<'a> IntegrityDbParser<'a> {
	pub fn new(title_id_path: &'a Path) -> Self {
		Self { title_id_path }
	}

	/// Parse whichever database variant the image carries.
	pub fn parse(&self) -> Result<IntegrityDb> {
		let pfs_dir = self.title_id_path.join("sce_pfs");

		let unified_path = pfs_dir.join("unicv.db");
		if unified_path.is_file() {
			info!("parsing {}", unified_path.display());
			return parse_unified(&unified_path);
		}

		let split_path = pfs_dir.join("icv.db");
		if split_path.is_dir() {
			info!("parsing {}", split_path.display());
			return parse_split(&split_path);
		}

		Err(Error::Format("failed to find unicv.db file or icv.db folder".into()))
	}
}

fn parse_unified(path: &Path) -> Result<IntegrityDb> {
	let mut input = File::open(path)?;
	let file_len = input.seek(SeekFrom::End(0))?;
	input.seek(SeekFrom::Start(0))?;

	let header: UnifiedDbHeader = input.read_le()?;
	if header.version != EXPECTED_DB_VERSION {
		return Err(Error::Format(format!("unexpected unicv.db version {}", header.version)));
	}
	if header.block_size != UNIFIED_DB_BLOCK_SIZE {
		return Err(Error::Format(format!("unexpected unicv.db block size {:#x}", header.block_size)));
	}
	if header.unk2 != u32::MAX || header.unk3 != u32::MAX {
		return Err(Error::Format("unexpected data in unicv.db header".into()));
	}

	let block_size = header.block_size as u64;
	if file_len < block_size || header.data_size != file_len - block_size {
		return Err(Error::Format("unicv.db data size does not match the file".into()));
	}

	let mut tables = Vec::new();
	let mut offset = block_size;
	while offset < file_len {
		input.seek(SeekFrom::Start(offset))?;
		let table_header: UnifiedTableHeader = input.read_le()?;

		if table_header.version != EXPECTED_DB_VERSION {
			return Err(Error::Format(format!("unexpected table version {}", table_header.version)));
		}
		if table_header.page_size != UNIFIED_DB_BLOCK_SIZE {
			return Err(Error::Format(format!("unexpected table page size {:#x}", table_header.page_size)));
		}
		if table_header.padding != 0 {
			return Err(Error::Format("unexpected padding in table header".into()));
		}

		let icv_salt = (offset / block_size) as u32;
		let leaves = read_icvs(&mut input, table_header.n_sectors)?;
		let nodes = read_icvs(&mut input, internal_node_count(table_header.n_sectors, table_header.bt_order))?;
		debug!("table {:#x}: {} sectors of {:#x}", icv_salt, table_header.n_sectors, table_header.sector_size);

		tables.push(IntegrityTable {
			icv_salt,
			n_sectors: table_header.n_sectors,
			sector_size: table_header.sector_size,
			arity: table_header.bt_order,
			signature: table_header.signature,
			leaves,
			nodes,
		});

		// The next table starts on the next database page boundary.
		let end = input.stream_position()?;
		offset = end.div_ceil(block_size) * block_size;
	}

	Ok(IntegrityDb { variant: DbVariant::Unified, tables })
}

fn parse_split(path: &Path) -> Result<IntegrityDb> {
	let mut tables = Vec::new();

	for entry in fs::read_dir(path)? {
		let entry = entry?;
		let entry_path = entry.path();
		let name = entry.file_name().to_string_lossy().into_owned();

		if !entry_path.is_file() {
			return Err(Error::Format(format!("unexpected entry {name} in icv.db")));
		}
		let icv_salt = parse_salt_name(&name)?;

		let mut input = File::open(&entry_path)?;
		let header: SplitTableHeader = input.read_le()?;
		if header.version != EXPECTED_DB_VERSION {
			return Err(Error::Format(format!("unexpected version {} in icv.db/{name}", header.version)));
		}
		if header.padding != 0 {
			return Err(Error::Format(format!("unexpected padding in icv.db/{name}")));
		}

		let leaves = read_icvs(&mut input, header.n_sectors)?;
		let nodes = read_icvs(&mut input, internal_node_count(header.n_sectors, header.bt_order))?;

		let mut rest = Vec::new();
		input.read_to_end(&mut rest)?;
		if !rest.is_empty() {
			return Err(Error::Format(format!("trailing data in icv.db/{name}")));
		}
		debug!("table {icv_salt:#x}: {} sectors of {:#x}", header.n_sectors, header.sector_size);

		tables.push(IntegrityTable {
			icv_salt,
			n_sectors: header.n_sectors,
			sector_size: header.sector_size,
			arity: header.bt_order,
			signature: header.signature,
			leaves,
			nodes,
		});
	}

	tables.sort_by_key(|t| t.icv_salt);
	Ok(IntegrityDb { variant: DbVariant::Split, tables })
}

/// Split-database file names are exactly eight lowercase hex digits: the
/// table salt assigned when the image was built.
fn parse_salt_name(name: &str) -> Result<u32> {
	if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
		return Err(Error::Format(format!("icv.db entry {name} is not a salt name")));
	}
	u32::from_str_radix(name, 16).map_err(|_| Error::Format(format!("icv.db entry {name} is not a salt name")))
}

fn read_icvs(input: &mut File, count: u32) -> Result<Vec<[u8; ICV_SIZE]>> {
	let mut icvs = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let mut icv = [0u8; ICV_SIZE];
		input.read_exact(&mut icv)?;
		icvs.push(icv);
	}
	Ok(icvs)
}
