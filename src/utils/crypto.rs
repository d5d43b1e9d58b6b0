use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::Digest;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 32;

// Key source order: ENCRYPTION_KEY env, then machine identifier. Container
// deployments without a stable machine UID must set the env var.
fn get_encryption_key() -> [u8; 32] {
    let seed = std::env::var("ENCRYPTION_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| machine_uid::get().unwrap_or_else(|_| "default".to_string()));
    let mut key = [0u8; 32];
    key.copy_from_slice(&sha2::Sha256::digest(seed.as_bytes()));
    key
}

pub fn encrypt_string(plaintext: &str) -> Result<String, String> {
    let key = get_encryption_key();
    let cipher = Aes256Gcm::new(&key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| format!("Encryption failed: {}", e))?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(packed))
}

pub fn decrypt_string(encrypted: &str) -> Result<String, String> {
    let key = get_encryption_key();
    let cipher = Aes256Gcm::new(&key.into());

    let decoded = general_purpose::STANDARD
        .decode(encrypted)
        .map_err(|e| format!("Base64 decode failed: {}", e))?;

    if decoded.len() <= NONCE_LEN {
        return Err("ciphertext too short".to_string());
    }
    let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| format!("Decryption failed: {}", e))?;
    String::from_utf8(plaintext).map_err(|e| format!("UTF-8 conversion failed: {}", e))
}

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Stable credential ID: hex SHA-256 over salt || refresh secret. The salt
/// keeps the digest from being a usable oracle for the secret itself.
pub fn salted_id(salt: &[u8], refresh_secret: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(salt);
    hasher.update(refresh_secret.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let secret = "1//0refresh-secret-value";
        let packed = encrypt_string(secret).expect("encrypt");
        assert_ne!(packed, secret);
        assert_eq!(decrypt_string(&packed).expect("decrypt"), secret);
    }

    #[test]
    fn distinct_nonces_give_distinct_ciphertexts() {
        let a = encrypt_string("same").unwrap();
        let b = encrypt_string("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn salted_id_is_stable_and_salt_sensitive() {
        let salt_a = vec![1u8; 32];
        let salt_b = vec![2u8; 32];
        let id1 = salted_id(&salt_a, "rs-1");
        assert_eq!(id1, salted_id(&salt_a, "rs-1"));
        assert_ne!(id1, salted_id(&salt_b, "rs-1"));
        assert_ne!(id1, salted_id(&salt_a, "rs-2"));
        assert_eq!(id1.len(), 32);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let packed = encrypt_string("payload").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&packed)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(decrypt_string(&tampered).is_err());
    }
}
