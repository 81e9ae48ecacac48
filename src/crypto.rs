//! Artifact encryption at rest
//!
//! AES-256-GCM in the STREAM construction over 64 KiB chunks, keyed by Argon2id
//! from the configured passphrase and a random per-file salt. Truncation,
//! reordering and bit flips all surface as [`CryptoError::Decryption`].
//!
//! File layout: `DBVE` magic, version byte, 16-byte salt, 7-byte nonce prefix,
//! then the sealed chunks.

use crate::config::EncryptionKey;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Suffix appended to encrypted artifacts
pub const ENCRYPTED_EXTENSION: &str = "enc";

const MAGIC: &[u8; 4] = b"DBVE";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;

/// Errors raised while encrypting or decrypting
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Argon2 could not derive a key
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Sealing a chunk failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong key, truncated file or tampered ciphertext
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The blocking worker panicked or was cancelled
    #[error("crypto worker failed: {0}")]
    Worker(String),
}

/// `<artifact>.enc`
pub fn encrypted_path(artifact: &Path) -> PathBuf {
    let mut name: OsString = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

/// Strip a trailing `.enc`, if any
pub fn plain_file_name(artifact: &Path) -> Option<String> {
    let name = artifact.file_name()?.to_str()?;
    Some(
        name.strip_suffix(&format!(".{}", ENCRYPTED_EXTENSION))
            .unwrap_or(name)
            .to_string(),
    )
}

/// Encrypt an artifact in place: the ciphertext is written next to it, renamed
/// to `<artifact>.enc`, and only then is the plaintext removed.
///
/// The caller owns the `encrypted` flag; passing an already encrypted file
/// double-encrypts it.
pub async fn encrypt(artifact: &Path, key: &EncryptionKey) -> Result<PathBuf, CryptoError> {
    let destination = encrypted_path(artifact);
    let mut staging = destination.clone().into_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let (src, tmp, key_clone) = (artifact.to_path_buf(), staging.clone(), key.clone());
    let result = tokio::task::spawn_blocking(move || encrypt_blocking(&src, &tmp, &key_clone))
        .await
        .map_err(|e| CryptoError::Worker(e.to_string()))
        .and_then(|r| r);

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }

    tokio::fs::rename(&staging, &destination).await?;
    tokio::fs::remove_file(artifact).await?;

    info!(artifact = %destination.display(), "Artifact encrypted");
    Ok(destination)
}

/// Decrypt `artifact` into `destination`, leaving the ciphertext untouched.
/// A failed decryption never leaves partial plaintext behind.
pub async fn decrypt(
    artifact: &Path,
    destination: &Path,
    key: &EncryptionKey,
) -> Result<PathBuf, CryptoError> {
    let (src, dest, key_clone) = (artifact.to_path_buf(), destination.to_path_buf(), key.clone());
    let result = tokio::task::spawn_blocking(move || decrypt_blocking(&src, &dest, &key_clone))
        .await
        .map_err(|e| CryptoError::Worker(e.to_string()))
        .and_then(|r| r);

    match result {
        Ok(()) => {
            debug!(artifact = %artifact.display(), output = %destination.display(), "Artifact decrypted");
            Ok(destination.to_path_buf())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(destination).await;
            Err(e)
        }
    }
}

fn derive_key(key: &EncryptionKey, salt: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    let mut derived = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(key.expose(), salt, &mut derived[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Aes256Gcm::new_from_slice(&derived[..]).map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

fn read_chunk<R: Read>(reader: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size);
    reader.by_ref().take(size as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

fn encrypt_blocking(src: &Path, dest: &Path, key: &EncryptionKey) -> Result<(), CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_prefix);

    let cipher = derive_key(key, &salt)?;
    let mut encryptor = EncryptorBE32::from_aead(cipher, nonce_prefix.as_slice().into());

    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])?;
    writer.write_all(&salt)?;
    writer.write_all(&nonce_prefix)?;

    // One chunk of look-ahead so the final chunk can be sealed as last.
    let mut current = read_chunk(&mut reader, CHUNK_SIZE)?;
    loop {
        let next = read_chunk(&mut reader, CHUNK_SIZE)?;
        if next.is_empty() {
            let sealed = encryptor
                .encrypt_last(current.as_slice())
                .map_err(|_| CryptoError::Encryption("failed to seal final chunk".to_string()))?;
            writer.write_all(&sealed)?;
            break;
        }
        let sealed = encryptor
            .encrypt_next(current.as_slice())
            .map_err(|_| CryptoError::Encryption("failed to seal chunk".to_string()))?;
        writer.write_all(&sealed)?;
        current = next;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn decrypt_blocking(src: &Path, dest: &Path, key: &EncryptionKey) -> Result<(), CryptoError> {
    let mut reader = BufReader::new(File::open(src)?);

    let mut header = [0u8; 4 + 1 + SALT_LEN + NONCE_PREFIX_LEN];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CryptoError::Decryption("file too short for header".to_string()),
        _ => CryptoError::Io(e),
    })?;
    if &header[..4] != MAGIC {
        return Err(CryptoError::Decryption("not an encrypted artifact".to_string()));
    }
    if header[4] != FORMAT_VERSION {
        return Err(CryptoError::Decryption(format!("unsupported format version {}", header[4])));
    }
    let salt = &header[5..5 + SALT_LEN];
    let nonce_prefix = &header[5 + SALT_LEN..];

    let cipher = derive_key(key, salt)?;
    let mut decryptor = DecryptorBE32::from_aead(cipher, nonce_prefix.into());
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut current = read_chunk(&mut reader, CHUNK_SIZE + TAG_LEN)?;
    if current.is_empty() {
        return Err(CryptoError::Decryption("ciphertext is truncated".to_string()));
    }
    loop {
        let next = read_chunk(&mut reader, CHUNK_SIZE + TAG_LEN)?;
        if next.is_empty() {
            let plain = decryptor.decrypt_last(current.as_slice()).map_err(|_| {
                CryptoError::Decryption("authentication failed (wrong key or corrupt data)".to_string())
            })?;
            writer.write_all(&plain)?;
            break;
        }
        let plain = decryptor.decrypt_next(current.as_slice()).map_err(|_| {
            CryptoError::Decryption("authentication failed (wrong key or corrupt data)".to_string())
        })?;
        writer.write_all(&plain)?;
        current = next;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
