use clap::Parser;
use pfsdump::crypto::SoftwareCryptoProvider;
use pfsdump::keys::{FileKeyEncryptor, KeyEncryptor, NativeKeyEncryptor};
use pfsdump::Klicensee;
use std::{error::Error, path::PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLine {
	/// The source title directory containing sce_pfs
	#[clap(long)]
	input: PathBuf,

	/// The destination directory for the plaintext tree
	#[clap(long)]
	output: PathBuf,

	/// The title's 16 byte klicensee as 32 hex digits
	#[clap(long)]
	klicensee: String,

	/// Resolve wrapped keys from a flat lookup file instead of deriving
	/// them natively
	#[clap(long)]
	keylist: Option<PathBuf>,

	/// Process integrity tables on a single thread for reproducible logs
	#[clap(long, takes_value = false)]
	sequential: bool,
}

fn parse_klicensee(text: &str) -> Result<Klicensee, Box<dyn Error>> {
	let bytes = hex::decode(text)?;
	Ok(bytes
		.try_into()
		.map_err(|_| "klicensee must be exactly 16 bytes of hex")?)
}

pub fn main() -> Result<(), Box<dyn Error>> {
	// Parse command line first
	let cl = CommandLine::parse();

	// Configure logging
	env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

	let klicensee = parse_klicensee(&cl.klicensee)?;

	let crypto = SoftwareCryptoProvider;
	let keyenc: Box<dyn KeyEncryptor + '_> = match &cl.keylist {
		Some(path) => Box::new(FileKeyEncryptor::new(path)),
		None => Box::new(NativeKeyEncryptor::new(&crypto)),
	};

	pfsdump::extract(&crypto, keyenc.as_ref(), klicensee, &cl.input, &cl.output, cl.sequential)?;
	Ok(())
}
