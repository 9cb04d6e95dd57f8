//! AES-256 in Infinite Garble Extension (IGE) mode.
//!
//! IGE chains on *both* the previous ciphertext and the previous plaintext:
//!
//! ```text
//! c[i] = E(p[i] ⊕ c[i-1]) ⊕ p[i-1]
//! p[i] = D(c[i] ⊕ p[i-1]) ⊕ c[i-1]
//! ```
//!
//! `c[0]` is seeded from the first IV half, `p[0]` from the second. A single
//! corrupted ciphertext block garbles every following block on decryption,
//! which is the property the MTProto integrity check relies on.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

const BLOCK: usize = 16;

/// Encrypt `buffer` in place. The buffer length must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in buffer.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = block.try_into().unwrap();

        let mut work = [0u8; BLOCK];
        for i in 0..BLOCK {
            work[i] = plain[i] ^ prev_cipher[i];
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut work));
        for i in 0..BLOCK {
            block[i] = work[i] ^ prev_plain[i];
        }

        prev_cipher.copy_from_slice(block);
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place. The buffer length must be a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in buffer.chunks_exact_mut(BLOCK) {
        let cipher_block: [u8; BLOCK] = block.try_into().unwrap();

        let mut work = [0u8; BLOCK];
        for i in 0..BLOCK {
            work[i] = cipher_block[i] ^ prev_plain[i];
        }
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut work));
        for i in 0..BLOCK {
            block[i] = work[i] ^ prev_cipher[i];
        }

        prev_plain.copy_from_slice(block);
        prev_cipher = cipher_block;
    }
}
