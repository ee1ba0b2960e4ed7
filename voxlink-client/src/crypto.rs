//! OCB-AES128 encryption for UDP voice packets
//!
//! Implements the OCB (Offset Codebook) authenticated encryption mode the
//! Mumble UDP channel uses, with a 24-bit truncated tag and a rolling
//! 32-bit nonce counter carried in the first ciphertext byte. The receive
//! side reconstructs the full counter from that single byte, so up to 127
//! packets may be lost or reordered before a resync is required.
//!
//! Packet layout: `[ctr_lsb:1][tag[0..3):3][ciphertext:|plaintext|]`

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// Bytes of the OCB tag carried on the wire
const TAG_BYTES: usize = 3;

/// Statistics kept by the crypto state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptStats {
    /// Successfully opened packets
    pub good: u32,
    /// Packets that arrived with an older nonce than expected
    pub late: u32,
    /// Packets skipped over by the nonce prediction
    pub lost: u32,
}

/// OCB-AES128 state for one voice connection
///
/// `encrypt` and `decrypt` take `&mut self`; the connection shares the
/// state behind a mutex so seal, open, and re-key never interleave.
pub struct CryptState {
    cipher: Option<Aes128>,
    client_nonce: [u8; BLOCK_SIZE],
    server_nonce: [u8; BLOCK_SIZE],
    encrypt_nonce: u32,
    decrypt_nonce: u32,
    last_good: u32,
    need_resync: bool,
    stats: CryptStats,
}

impl CryptState {
    /// Create an uninitialized state; `init` must be called before use
    pub fn new() -> Self {
        Self {
            cipher: None,
            client_nonce: [0u8; BLOCK_SIZE],
            server_nonce: [0u8; BLOCK_SIZE],
            encrypt_nonce: 0,
            decrypt_nonce: 0,
            last_good: 0,
            need_resync: false,
            stats: CryptStats::default(),
        }
    }

    /// Install key material from a CryptSetup message
    ///
    /// Resets both nonce counters and clears the resync flag.
    pub fn init(
        &mut self,
        key: &[u8; BLOCK_SIZE],
        client_nonce: &[u8; BLOCK_SIZE],
        server_nonce: &[u8; BLOCK_SIZE],
    ) {
        self.cipher = Some(Aes128::new(GenericArray::from_slice(key)));
        self.client_nonce = *client_nonce;
        self.server_nonce = *server_nonce;
        self.encrypt_nonce = 0;
        self.decrypt_nonce = 0;
        self.last_good = 0;
        self.need_resync = false;
        self.stats = CryptStats::default();
    }

    /// Replace only the decrypt nonce (server-initiated resync)
    pub fn set_decrypt_nonce(&mut self, server_nonce: &[u8; BLOCK_SIZE]) {
        self.server_nonce = *server_nonce;
        self.decrypt_nonce = 0;
        self.last_good = 0;
        self.need_resync = false;
    }

    /// Whether key material has been installed
    pub fn is_valid(&self) -> bool {
        self.cipher.is_some()
    }

    /// Whether a decrypt failure has flagged the state for resync
    pub fn needs_resync(&self) -> bool {
        self.need_resync
    }

    /// Packet statistics
    pub fn stats(&self) -> CryptStats {
        self.stats
    }

    /// Seal a plaintext into `[ctr_lsb | tag[0..3) | ciphertext]`
    ///
    /// Fails if the state is uninitialized or the 32-bit send counter is
    /// exhausted (the connection then needs a fresh CryptSetup).
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, String> {
        if self.cipher.is_none() {
            return Err("crypto state not initialized".to_string());
        }
        if self.encrypt_nonce == u32::MAX {
            return Err("encrypt nonce exhausted; new CryptSetup required".to_string());
        }

        self.encrypt_nonce = self.encrypt_nonce.wrapping_add(1);

        let mut nonce = self.client_nonce;
        nonce[..4].copy_from_slice(&self.encrypt_nonce.to_le_bytes());

        let mut out = vec![0u8; plain.len() + 4];
        let mut ciphertext = vec![0u8; plain.len()];
        let tag = self.ocb_encrypt(plain, &mut ciphertext, &nonce);

        out[0] = nonce[0];
        out[1..4].copy_from_slice(&tag[..TAG_BYTES]);
        out[4..].copy_from_slice(&ciphertext);

        Ok(out)
    }

    /// Open a sealed packet, recovering the plaintext
    ///
    /// On tag mismatch the resync flag is set, the decrypt counter is left
    /// untouched, and an error is returned.
    pub fn decrypt(&mut self, source: &[u8]) -> Result<Vec<u8>, String> {
        if self.cipher.is_none() {
            return Err("crypto state not initialized".to_string());
        }
        if source.len() < 4 {
            return Err("packet too short".to_string());
        }

        // Predict the full 32-bit counter from its transmitted low byte.
        let diff = (source[0].wrapping_sub(self.decrypt_nonce as u8)) as i8;
        let predicted = self.decrypt_nonce.wrapping_add(diff as i64 as u32);

        let mut nonce = self.server_nonce;
        nonce[..4].copy_from_slice(&predicted.to_le_bytes());

        let mut plain = vec![0u8; source.len() - 4];
        let tag = self.ocb_decrypt(&source[4..], &mut plain, &nonce);

        if tag[..TAG_BYTES] != source[1..4] {
            self.need_resync = true;
            return Err("tag mismatch".to_string());
        }

        if predicted > self.last_good {
            // Counters skipped between the previous good packet and this one
            self.stats.lost = self
                .stats
                .lost
                .wrapping_add(predicted - self.last_good - 1);
            self.last_good = predicted;
        } else {
            self.stats.late = self.stats.late.wrapping_add(1);
        }
        self.stats.good = self.stats.good.wrapping_add(1);
        self.decrypt_nonce = predicted.wrapping_add(1);

        Ok(plain)
    }

    fn aes_encrypt(&self, block: &mut [u8; BLOCK_SIZE]) {
        let cipher = self.cipher.as_ref().expect("checked by callers");
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn aes_decrypt(&self, block: &mut [u8; BLOCK_SIZE]) {
        let cipher = self.cipher.as_ref().expect("checked by callers");
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    /// L = E_K(0^128), the block-offset subkey
    fn subkey(&self) -> [u8; BLOCK_SIZE] {
        let mut l = [0u8; BLOCK_SIZE];
        self.aes_encrypt(&mut l);
        l
    }

    fn ocb_encrypt(
        &self,
        plain: &[u8],
        encrypted: &mut [u8],
        nonce: &[u8; BLOCK_SIZE],
    ) -> [u8; BLOCK_SIZE] {
        let l = self.subkey();

        let mut offset = *nonce;
        self.aes_encrypt(&mut offset);
        let mut checksum = [0u8; BLOCK_SIZE];

        let full_blocks = plain.len() / BLOCK_SIZE;
        for i in 0..full_blocks {
            xor_block(&mut offset, &l);

            let block: &[u8] = &plain[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
            let mut tmp = [0u8; BLOCK_SIZE];
            tmp.copy_from_slice(block);
            xor_block(&mut tmp, &offset);
            self.aes_encrypt(&mut tmp);
            xor_block(&mut tmp, &offset);
            encrypted[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&tmp);

            for (c, p) in checksum.iter_mut().zip(block) {
                *c ^= p;
            }
        }

        let remaining = plain.len() % BLOCK_SIZE;
        if remaining > 0 {
            offset = shift(&offset);

            let mut pad = offset;
            self.aes_encrypt(&mut pad);

            let base = full_blocks * BLOCK_SIZE;
            for i in 0..remaining {
                encrypted[base + i] = plain[base + i] ^ pad[i];
                checksum[i] ^= plain[base + i];
            }
            checksum[remaining] ^= 0x80;
        }

        xor_block(&mut checksum, &offset);
        self.aes_encrypt(&mut checksum);
        checksum
    }

    fn ocb_decrypt(
        &self,
        encrypted: &[u8],
        plain: &mut [u8],
        nonce: &[u8; BLOCK_SIZE],
    ) -> [u8; BLOCK_SIZE] {
        let l = self.subkey();

        let mut offset = *nonce;
        self.aes_encrypt(&mut offset);
        let mut checksum = [0u8; BLOCK_SIZE];

        let full_blocks = encrypted.len() / BLOCK_SIZE;
        for i in 0..full_blocks {
            xor_block(&mut offset, &l);

            let mut tmp = [0u8; BLOCK_SIZE];
            tmp.copy_from_slice(&encrypted[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]);
            xor_block(&mut tmp, &offset);
            self.aes_decrypt(&mut tmp);
            xor_block(&mut tmp, &offset);
            plain[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&tmp);

            for (c, p) in checksum.iter_mut().zip(&tmp) {
                *c ^= p;
            }
        }

        let remaining = encrypted.len() % BLOCK_SIZE;
        if remaining > 0 {
            offset = shift(&offset);

            let mut pad = offset;
            self.aes_encrypt(&mut pad);

            let base = full_blocks * BLOCK_SIZE;
            for i in 0..remaining {
                plain[base + i] = encrypted[base + i] ^ pad[i];
                checksum[i] ^= plain[base + i];
            }
            checksum[remaining] ^= 0x80;
        }

        xor_block(&mut checksum, &offset);
        self.aes_encrypt(&mut checksum);
        checksum
    }
}

impl Default for CryptState {
    fn default() -> Self {
        Self::new()
    }
}

fn xor_block(dst: &mut [u8; BLOCK_SIZE], src: &[u8; BLOCK_SIZE]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Double in GF(2^128) with reduction polynomial 0x87
fn shift(src: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut dst = [0u8; BLOCK_SIZE];
    let carry = src[0] >> 7;
    for i in 0..BLOCK_SIZE - 1 {
        dst[i] = (src[i] << 1) | (src[i + 1] >> 7);
    }
    dst[BLOCK_SIZE - 1] = (src[BLOCK_SIZE - 1] << 1) ^ if carry != 0 { 0x87 } else { 0 };
    dst
}
