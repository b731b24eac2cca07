//! Bucket volume-key management.
//!
//! Volume keys wrap the per-bucket data-encrypting key; this tool creates,
//! lists, re-wraps, clones, and deletes them. Configuration comes from the
//! `CIRRUS_*` environment, like the mount itself.
//!
//! # Usage
//!
//! ```text
//! cirrus-volkey list
//! cirrus-volkey generate <key-id> [--out-key FILE]
//! cirrus-volkey change <key-id> [--in-key FILE] [--out-key FILE]
//! cirrus-volkey clone <from-id> <to-id> [--in-key FILE] [--out-key FILE]
//! cirrus-volkey delete <key-id>
//! ```
//!
//! Without `--in-key`/`--out-key`, wrap keys are derived from passwords
//! read on the terminal; with them, raw keys are read from or written to
//! owner-only files.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use cirrus_core::Config;
use cirrus_crypto::{SecretBuffer, read_password, read_private_file, write_private_file};
use cirrus_fs::{Encryption, Filesystem, FilesystemBuilder, VolumeKey};
use cirrus_transport::Priority;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

const WRAP_KEY_LEN: usize = 32;

struct Options {
    in_key: Option<String>,
    out_key: Option<String>,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        in_key: None,
        out_key: None,
        positional: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--in-key" => {
                options.in_key = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("--in-key needs a file argument"))?
                        .clone(),
                );
            }
            "--out-key" => {
                options.out_key = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("--out-key needs a file argument"))?
                        .clone(),
                );
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            other => options.positional.push(other.to_owned()),
        }
    }

    Ok(options)
}

fn usage() -> ! {
    eprintln!(
        "usage: cirrus-volkey <command> [options]\n\
         \n\
         commands:\n\
         \x20 list\n\
         \x20 generate <key-id> [--out-key FILE]\n\
         \x20 change <key-id> [--in-key FILE] [--out-key FILE]\n\
         \x20 clone <from-id> <to-id> [--in-key FILE] [--out-key FILE]\n\
         \x20 delete <key-id>"
    );
    std::process::exit(1);
}

fn build_engine() -> Result<Arc<Filesystem>> {
    let mut config = Config::from_env();
    // Key management must work before any key can be unlocked.
    config.use_encryption = false;

    FilesystemBuilder::new(config)
        .build()
        .map_err(|e| anyhow!("failed to initialize: {e}"))
}

fn confirm(prompt: &str, expected: &str) -> Result<()> {
    print!("{prompt}");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    if line.trim().eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        bail!("aborted")
    }
}

fn prompt_for_new_password(config: &Config, key_id: &str) -> Result<SecretBuffer> {
    let password = read_password(&format!("Enter new password for [{key_id}]: "))?;
    if password.is_empty() {
        bail!("password cannot be empty");
    }

    let second = read_password(&format!("Confirm new password for [{key_id}]: "))?;
    if second != password {
        bail!("passwords do not match");
    }

    Ok(Encryption::derive_wrap_key(config, &password))
}

fn prompt_for_current_password(config: &Config, key_id: &str) -> Result<SecretBuffer> {
    let password = read_password(&format!("Enter current password for [{key_id}]: "))?;
    if password.is_empty() {
        bail!("current password not specified");
    }

    Ok(Encryption::derive_wrap_key(config, &password))
}

fn read_wrap_key_from_file(file: &str) -> Result<SecretBuffer> {
    println!("Reading key from [{file}]...");
    let line = read_private_file(file)?;
    SecretBuffer::from_hex(&line).context("key file does not hold a hex key")
}

fn generate_and_write_wrap_key(file: &str) -> Result<SecretBuffer> {
    let key = SecretBuffer::generate(WRAP_KEY_LEN);
    println!("Writing key to [{file}]...");
    write_private_file(file, &key.to_hex())?;
    Ok(key)
}

fn in_wrap_key(config: &Config, options: &Options, key_id: &str) -> Result<SecretBuffer> {
    match &options.in_key {
        Some(file) => read_wrap_key_from_file(file),
        None => prompt_for_current_password(config, key_id),
    }
}

fn out_wrap_key(config: &Config, options: &Options, key_id: &str) -> Result<SecretBuffer> {
    match &options.out_key {
        Some(file) => generate_and_write_wrap_key(file),
        None => prompt_for_new_password(config, key_id),
    }
}

fn fetch_key(fs: &Arc<Filesystem>, key_id: &str) -> Result<VolumeKey> {
    let context = Arc::clone(fs.context());
    let key_id = key_id.to_owned();
    let slot: Arc<Mutex<Option<VolumeKey>>> = Arc::new(Mutex::new(None));
    let slot_out = Arc::clone(&slot);

    fs.context()
        .pool
        .call(
            Priority::PrReq0,
            Box::new(move |request| {
                *slot_out.lock() = VolumeKey::fetch(&context, request, &key_id)?;
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("{e}"))?;

    let key = slot.lock().take();
    key.ok_or_else(|| anyhow!("key not found"))
}

fn with_request(
    fs: &Arc<Filesystem>,
    work: impl Fn(&mut cirrus_transport::Request) -> cirrus_core::Result<()>
    + Send
    + Sync
    + 'static,
) -> Result<()> {
    fs.context()
        .pool
        .call(Priority::PrReq0, Box::new(move |request| work(request)))
        .map_err(|e| anyhow!("{e}"))
}

fn cmd_list(fs: &Arc<Filesystem>) -> Result<()> {
    let bucket = &fs.context().config.bucket_name;
    let ids = VolumeKey::list_ids(fs.context()).map_err(|e| anyhow!("{e}"))?;

    if ids.is_empty() {
        println!("No keys found for bucket [{bucket}].");
    } else {
        println!("Keys for bucket [{bucket}]:");
        for id in ids {
            println!("  {id}");
        }
    }

    Ok(())
}

fn cmd_generate(fs: &Arc<Filesystem>, options: &Options, key_id: &str) -> Result<()> {
    let config = &fs.context().config;

    let existing = VolumeKey::list_ids(fs.context()).map_err(|e| anyhow!("{e}"))?;
    if !existing.is_empty() {
        bail!("bucket already contains one or more keys. clone an existing key.");
    }

    println!("This bucket does not currently have an encryption key. We'll create one.\n");
    let wrap_key = out_wrap_key(config, options, key_id)?;

    println!(
        "Generating volume key [{key_id}] for bucket [{}]...",
        config.bucket_name
    );

    let context = Arc::clone(fs.context());
    let key_id = key_id.to_owned();
    with_request(fs, move |request| {
        let key = VolumeKey::generate(&context, request, &key_id)?;
        key.commit(request, &wrap_key)
    })?;

    println!("Done.");
    Ok(())
}

fn cmd_change(fs: &Arc<Filesystem>, options: &Options, key_id: &str) -> Result<()> {
    let config = fs.context().config.clone();

    let mut key = fetch_key(fs, key_id)?;
    key.unlock(&in_wrap_key(&config, options, key_id)?)
        .map_err(|e| anyhow!("{e}"))?;

    let new_wrap_key = out_wrap_key(&config, options, key_id)?;

    println!("Re-wrapping volume key [{key_id}]...");
    with_request(fs, move |request| key.commit(request, &new_wrap_key))?;

    println!("Done.");
    Ok(())
}

fn cmd_clone(fs: &Arc<Filesystem>, options: &Options, from_id: &str, to_id: &str) -> Result<()> {
    let config = fs.context().config.clone();

    let mut key = fetch_key(fs, from_id)?;
    key.unlock(&in_wrap_key(&config, options, from_id)?)
        .map_err(|e| anyhow!("{e}"))?;

    let cloned = key.clone_to(to_id).map_err(|e| anyhow!("{e}"))?;
    let wrap_key = out_wrap_key(&config, options, to_id)?;

    println!("Cloning volume key [{from_id}] to [{to_id}]...");
    with_request(fs, move |request| cloned.commit(request, &wrap_key))?;

    println!("Done.");
    Ok(())
}

fn cmd_delete(fs: &Arc<Filesystem>, key_id: &str) -> Result<()> {
    let bucket = fs.context().config.bucket_name.clone();
    let remaining = VolumeKey::list_ids(fs.context()).map_err(|e| anyhow!("{e}"))?;

    if remaining.len() <= 1 {
        println!(
            "You are going to delete the last remaining volume encryption key for bucket:\n  {bucket}\n"
        );
        confirm(
            "To confirm, enter the name of the bucket (case sensitive): ",
            &bucket,
        )?;
        println!(
            "\nWARNING: this renders every encrypted object in this bucket permanently inaccessible.\n"
        );
        confirm(
            "Do you understand that existing encrypted files will be lost forever? Type \"yes\": ",
            "yes",
        )?;
        confirm(
            "Do you understand that this operation cannot be undone? Type \"yes\": ",
            "yes",
        )?;
    } else {
        confirm(
            &format!(
                "You are going to delete volume encryption key [{key_id}] for bucket \
                 [{bucket}]. Are you sure?\nEnter \"yes\": "
            ),
            "yes",
        )?;
    }

    let key = fetch_key(fs, key_id)?;
    with_request(fs, move |request| key.remove(request))?;

    println!("Done.");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        usage();
    };
    let options = parse_options(rest)?;

    let fs = build_engine()?;

    let result = match (command.as_str(), options.positional.as_slice()) {
        ("list", []) => cmd_list(&fs),
        ("generate", [key_id]) => cmd_generate(&fs, &options, key_id),
        ("change", [key_id]) => cmd_change(&fs, &options, key_id),
        ("clone", [from_id, to_id]) => cmd_clone(&fs, &options, from_id, to_id),
        ("delete", [key_id]) => cmd_delete(&fs, key_id),
        _ => usage(),
    };

    fs.terminate();
    result
}
