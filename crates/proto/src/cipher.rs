//! AES-128 in 8-bit cipher-feedback mode, the per-channel stream cipher.
//!
//! Each proxied channel gets its own [`StreamCipher`] keyed with that
//! channel's shared secret; the IV starts as a copy of the key and advances
//! one byte per plaintext byte. Encrypt and decrypt state are independent,
//! so a single instance serves both directions of one socket.

use aes::cipher::inout::InOutBuf;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;

type Cfb8Encryptor = cfb8::Encryptor<Aes128>;
type Cfb8Decryptor = cfb8::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;

pub struct StreamCipher {
    encryptor: Cfb8Encryptor,
    decryptor: Cfb8Decryptor,
}

impl StreamCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            encryptor: Cfb8Encryptor::new(key.into(), key.into()),
            decryptor: Cfb8Decryptor::new(key.into(), key.into()),
        }
    }

    /// Encrypts in place, advancing the outbound IV state.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty());
        self.encryptor.encrypt_blocks_inout_mut(blocks);
    }

    /// Decrypts in place, advancing the inbound IV state.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty());
        self.decryptor.decrypt_blocks_inout_mut(blocks);
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamCipher")
    }
}
