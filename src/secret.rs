use crate::crypto::{CryptoProvider, KEY_SIZE};
use crate::error::Result;
use crate::keys::KeyEncryptor;

// Seed constants feeding the key-wrap service. One per derivation role; the
// pipelines below are the single substitution point for a firmware-exact
// port (see DESIGN.md).
const SECRET_SEED: [u8; KEY_SIZE] = [
	0x8A, 0x51, 0x0F, 0x3C, 0xE4, 0x72, 0xB9, 0x06, 0x2E, 0xDD, 0x41, 0x98, 0xAF, 0x13, 0x67, 0xC0,
];
const KEYGEN_SEED: [u8; KEY_SIZE] = [
	0x27, 0xB3, 0x9E, 0x54, 0x08, 0xC1, 0x7A, 0xEF, 0x63, 0x0D, 0xF2, 0x46, 0xBC, 0x85, 0x19, 0x3A,
];
const CIPHER_SEED: [u8; KEY_SIZE] = [
	0xD4, 0x6B, 0x20, 0xFE, 0x91, 0x3D, 0x58, 0xA7, 0x0C, 0xE5, 0x74, 0xB2, 0x8F, 0x36, 0xC9, 0x12,
];
const MAC_SEED: [u8; KEY_SIZE] = [
	0x49, 0xE0, 0xB5, 0x1C, 0x62, 0xAD, 0x07, 0xF8, 0x94, 0x2B, 0xD3, 0x5E, 0x78, 0xC6, 0x01, 0xBF,
];

/// Secret selector for the files.db header and node ICVs.
pub const SELECTOR_FILES_DB: u32 = 0;
/// Secret selector for a per-file integrity table.
pub const SELECTOR_TABLE: u32 = 1;
/// Secret selector for the keystone check.
pub const SELECTOR_KEYSTONE: u32 = 2;

/// Sector cipher selected by the image mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
	Cbc,
	Ctr,
	Ecb,
}

/// Crypto-engine behavior decoded from the header's image spec: whether key
/// derivation runs the extra keygen wrap and which sector cipher applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoEngine {
	pub keygen: bool,
	pub mode: CipherMode,
}

impl CryptoEngine {
	pub const PLAIN: CryptoEngine = CryptoEngine { keygen: false, mode: CipherMode::Cbc };
}

/// Per-sector material for one file sector: cipher key, cipher IV and the
/// key the sector's ICV is computed under.
pub struct SectorKeys {
	pub key: [u8; KEY_SIZE],
	pub iv: [u8; KEY_SIZE],
	pub mac_key: [u8; 20],
}

fn derive_base(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: &[u8; KEY_SIZE],
	seed: &[u8; KEY_SIZE],
	engine: CryptoEngine,
) -> Result<[u8; KEY_SIZE]> {
	let mut base = *klicensee;
	crypto.aes_ecb_encrypt(&mut base, &keyenc.encrypt_key(seed)?)?;
	if engine.keygen {
		crypto.aes_ecb_encrypt(&mut base, &keyenc.encrypt_key(&KEYGEN_SEED)?)?;
	}
	Ok(base)
}

/// Produce the 20 byte secret for one entity. `salt` is the files-salt for
/// the files.db, the per-file salt for integrity tables, or the stored salt
/// for the keystone; `icv_salt` is the table's page number or name hash.
pub fn get_secret(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: &[u8; KEY_SIZE],
	salt: &[u8; KEY_SIZE],
	engine: CryptoEngine,
	icv_salt: u32,
	selector: u32,
	subselector: u32,
) -> Result<[u8; 20]> {
	let base = derive_base(crypto, keyenc, klicensee, &SECRET_SEED, engine)?;

	let mut message = [0u8; KEY_SIZE + 12];
	message[..KEY_SIZE].copy_from_slice(salt);
	message[KEY_SIZE..KEY_SIZE + 4].copy_from_slice(&icv_salt.to_le_bytes());
	message[KEY_SIZE + 4..KEY_SIZE + 8].copy_from_slice(&selector.to_le_bytes());
	message[KEY_SIZE + 8..].copy_from_slice(&subselector.to_le_bytes());

	crypto.hmac_sha1(&message, &base)
}

/// Derive the cipher and MAC material for sector `sector` of the file with
/// the given per-file salt/IV, protected by the table identified by
/// `icv_salt`.
pub fn sector_keys(
	crypto: &dyn CryptoProvider,
	keyenc: &dyn KeyEncryptor,
	klicensee: &[u8; KEY_SIZE],
	file_salt: &[u8; KEY_SIZE],
	file_iv: &[u8; KEY_SIZE],
	engine: CryptoEngine,
	icv_salt: u32,
	sector: u64,
) -> Result<SectorKeys> {
	let mut message = [0u8; 2 * KEY_SIZE + 12];
	message[..KEY_SIZE].copy_from_slice(file_salt);
	message[KEY_SIZE..2 * KEY_SIZE].copy_from_slice(file_iv);
	message[2 * KEY_SIZE..2 * KEY_SIZE + 4].copy_from_slice(&icv_salt.to_le_bytes());
	message[2 * KEY_SIZE + 4..].copy_from_slice(&sector.to_le_bytes());

	let cipher_base = derive_base(crypto, keyenc, klicensee, &CIPHER_SEED, engine)?;
	let derived = crypto.hmac_sha256(&message, &cipher_base)?;

	let mac_base = derive_base(crypto, keyenc, klicensee, &MAC_SEED, engine)?;
	let mac_key = crypto.hmac_sha1(&message, &mac_base)?;

	let mut key = [0u8; KEY_SIZE];
	let mut iv = [0u8; KEY_SIZE];
	key.copy_from_slice(&derived[..KEY_SIZE]);
	iv.copy_from_slice(&derived[KEY_SIZE..]);
	Ok(SectorKeys { key, iv, mac_key })
}
