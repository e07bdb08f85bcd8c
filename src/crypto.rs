use crate::error::{Error, Result};
use aes::cipher::{
	block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher,
};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// All keys in the image are 128 bit.
pub const KEY_SIZE: usize = 0x10;

/// Integrity check values are HMAC-SHA1 tags.
pub const ICV_SIZE: usize = 0x14;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

/// The capability set consumed by every other subsystem. Buffers are
/// transformed in place, so source and destination always alias; CBC must
/// latch the follow-up IV before overwriting and CTR advances the counter by
/// `len / 16` as a 128 bit big-endian integer.
pub trait CryptoProvider: Send + Sync {
	fn aes_cbc_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()>;
	fn aes_cbc_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()>;
	fn aes_ctr_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()>;
	fn aes_ctr_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()>;
	fn aes_ecb_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE]) -> Result<()>;
	fn aes_ecb_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE]) -> Result<()>;
	fn aes_cmac(&self, data: &[u8], key: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]>;
	fn sha1(&self, data: &[u8]) -> Result<[u8; 20]>;
	fn sha256(&self, data: &[u8]) -> Result<[u8; 32]>;
	fn hmac_sha1(&self, data: &[u8], key: &[u8]) -> Result<[u8; 20]>;
	fn hmac_sha256(&self, data: &[u8], key: &[u8]) -> Result<[u8; 32]>;
}

/// Provider backed by the RustCrypto crates.
pub struct SoftwareCryptoProvider;

impl CryptoProvider for SoftwareCryptoProvider {
	fn aes_cbc_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}
		let len = data.len();
		Aes128CbcEnc::new(key.into(), (&*iv).into())
			.encrypt_padded_mut::<NoPadding>(data, len)
			.map_err(|_| Error::CryptoFailure)?;
		iv.copy_from_slice(&data[len - KEY_SIZE..]);
		Ok(())
	}

	fn aes_cbc_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}
		// The follow-up IV is the last ciphertext block; latch it before the
		// in-place decryption destroys it.
		let mut next_iv = [0u8; KEY_SIZE];
		next_iv.copy_from_slice(&data[data.len() - KEY_SIZE..]);
		Aes128CbcDec::new(key.into(), (&*iv).into())
			.decrypt_padded_mut::<NoPadding>(data)
			.map_err(|_| Error::CryptoFailure)?;
		*iv = next_iv;
		Ok(())
	}

	fn aes_ctr_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()> {
		self.aes_ctr(data, key, iv)
	}

	fn aes_ctr_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()> {
		self.aes_ctr(data, key, iv)
	}

	fn aes_ecb_encrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE]) -> Result<()> {
		let len = data.len();
		Aes128EcbEnc::new(key.into())
			.encrypt_padded_mut::<NoPadding>(data, len)
			.map_err(|_| Error::CryptoFailure)?;
		Ok(())
	}

	fn aes_ecb_decrypt(&self, data: &mut [u8], key: &[u8; KEY_SIZE]) -> Result<()> {
		Aes128EcbDec::new(key.into())
			.decrypt_padded_mut::<NoPadding>(data)
			.map_err(|_| Error::CryptoFailure)?;
		Ok(())
	}

	fn aes_cmac(&self, data: &[u8], key: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]> {
		let mut mac = <Cmac<Aes128> as KeyInit>::new_from_slice(key).map_err(|_| Error::CryptoFailure)?;
		mac.update(data);
		Ok(mac.finalize().into_bytes().into())
	}

	fn sha1(&self, data: &[u8]) -> Result<[u8; 20]> {
		Ok(Sha1::new().chain_update(data).finalize().into())
	}

	fn sha256(&self, data: &[u8]) -> Result<[u8; 32]> {
		Ok(Sha256::new().chain_update(data).finalize().into())
	}

	fn hmac_sha1(&self, data: &[u8], key: &[u8]) -> Result<[u8; 20]> {
		let mut mac = <Hmac<Sha1> as KeyInit>::new_from_slice(key).map_err(|_| Error::CryptoFailure)?;
		mac.update(data);
		Ok(mac.finalize().into_bytes().into())
	}

	fn hmac_sha256(&self, data: &[u8], key: &[u8]) -> Result<[u8; 32]> {
		let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key).map_err(|_| Error::CryptoFailure)?;
		mac.update(data);
		Ok(mac.finalize().into_bytes().into())
	}
}

impl SoftwareCryptoProvider {
	fn aes_ctr(&self, data: &mut [u8], key: &[u8; KEY_SIZE], iv: &mut [u8; KEY_SIZE]) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}
		Aes128Ctr::new(key.into(), (&*iv).into()).apply_keystream(data);

		// Advance the caller's counter by the number of whole blocks, as a
		// 128 bit big-endian addition.
		let counter = u128::from_be_bytes(*iv).wrapping_add((data.len() / KEY_SIZE) as u128);
		*iv = counter.to_be_bytes();
		Ok(())
	}
}
