// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session security for remote connections.
//!
//! Remote clients authenticate with a two message password
//! authenticated key exchange that fits the fixed 64 byte session
//! field:
//!
//! ```text
//! C -> D  session = client pubkey (32) || client random (32)
//! D -> C  session = server pubkey (32) || sealed token  (32)
//! C -> D  session = sealed proof   (32) || zero padding  (32)
//! ```
//!
//! Both sides derive the same verifier from the password (PBKDF2 over
//! a salt hashed from the username) and mix it into the key derived
//! from the X25519 exchange, so only a peer that knows the password
//! can open the token and seal the proof. The agreed key then seals
//! every payload in both directions.
//!
//! Payload nonces come from the monotonically incremented counter in
//! the entry header; the daemon replies under counter + 1 and a
//! direction byte keeps the two sides from ever colliding.

use std::{fs, os::unix::fs::PermissionsExt as _, path::Path};

use anyhow::{anyhow, Context};
use blake2::{Blake2s256, Digest as _};
use chacha20poly1305::{
    aead::{Aead as _, KeyInit as _},
    XChaCha20Poly1305, XNonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore as _};
use sha2::Sha512;
use subtle::ConstantTimeEq as _;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::consts;
use usched_protocol::SESSION_SIZE;

pub const KEY_SIZE: usize = 32;
pub const VERIFIER_SIZE: usize = 64;
pub const TOKEN_SIZE: usize = 16;
/// A sealed 16 byte token: ciphertext plus the 16 byte tag.
pub const SEALED_TOKEN_SIZE: usize = 32;

const PRIVATE_KEY_FILE: &str = "key.priv";
const PUBLIC_KEY_FILE: &str = "key.pub";

/// Direction bytes for payload nonces.
pub const DIR_CLIENT: u8 = 0;
pub const DIR_DAEMON: u8 = 1;

// Fixed handshake nonces. Each is used at most once per agreed key,
// and the directions are disjoint from payload nonces.
const NONCE_TOKEN: [u8; 24] = *b"usched.handshake.token..";
const NONCE_PROOF: [u8; 24] = *b"usched.handshake.proof..";

/// The daemon's long lived key pair, loaded from (or generated into)
/// the keys directory on first start.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair { secret, public }
    }

    pub fn load_or_generate(keys_dir: &Path) -> anyhow::Result<KeyPair> {
        let priv_path = keys_dir.join(PRIVATE_KEY_FILE);
        let pub_path = keys_dir.join(PUBLIC_KEY_FILE);

        if priv_path.exists() {
            let raw = fs::read(&priv_path).context("reading private key")?;
            let raw: [u8; KEY_SIZE] =
                raw.try_into().map_err(|_| anyhow!("private key file has the wrong size"))?;
            let secret = StaticSecret::from(raw);
            let public = PublicKey::from(&secret);
            return Ok(KeyPair { secret, public });
        }

        info!("no key material found, generating a fresh key pair");
        fs::create_dir_all(keys_dir).context("creating keys dir")?;
        let pair = KeyPair::generate();
        for (path, bytes) in
            [(&priv_path, pair.secret.to_bytes()), (&pub_path, pair.public.to_bytes())]
        {
            fs::write(path, bytes).with_context(|| format!("writing {path:?}"))?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting {path:?}"))?;
        }
        Ok(pair)
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }
}

/// The deterministic PBKDF2 salt for a username: BLAKE2s over the
/// name padded with 'x' to the full field width. Deterministic so
/// the client can re-derive the verifier from the password alone.
pub fn username_salt(username: &str) -> anyhow::Result<[u8; 32]> {
    if username.len() > usched_protocol::USERNAME_SIZE {
        return Err(anyhow!("username '{}' too long to salt", username));
    }
    let mut padded = [b'x'; usched_protocol::USERNAME_SIZE];
    padded[..username.len()].copy_from_slice(username.as_bytes());
    Ok(Blake2s256::digest(padded).into())
}

/// The password verifier both sides of the exchange derive:
/// PBKDF2-SHA512 over the plaintext password.
pub fn derive_verifier(username: &str, password: &str) -> anyhow::Result<[u8; VERIFIER_SIZE]> {
    let salt = username_salt(username)?;
    let mut verifier = [0u8; VERIFIER_SIZE];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, consts::PBKDF2_ROUNDS, &mut verifier);
    Ok(verifier)
}

fn agreed_key(
    shared: &[u8; KEY_SIZE],
    verifier: &[u8; VERIFIER_SIZE],
    client_session: &[u8; SESSION_SIZE],
    server_public: &[u8; KEY_SIZE],
) -> [u8; KEY_SIZE] {
    let mut hasher = Blake2s256::new();
    hasher.update(shared);
    hasher.update(verifier);
    hasher.update(client_session);
    hasher.update(server_public);
    hasher.finalize().into()
}

fn seal_with(key: &[u8; KEY_SIZE], nonce: &[u8; 24], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| anyhow!("sealing {} bytes failed", plaintext.len()))
}

fn open_with(key: &[u8; KEY_SIZE], nonce: &[u8; 24], sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| anyhow!("opening {} bytes failed", sealed.len()))
}

fn payload_nonce(counter: u64, direction: u8) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0] = direction;
    nonce[16..24].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// An established session key; seals and opens payloads under the
/// header's nonce counter.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; KEY_SIZE],
}

impl SessionKey {
    pub fn seal(&self, counter: u64, direction: u8, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        seal_with(&self.key, &payload_nonce(counter, direction), plaintext)
    }

    pub fn open(&self, counter: u64, direction: u8, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        open_with(&self.key, &payload_nonce(counter, direction), sealed)
    }
}

/// Server side state between sending the token and checking the
/// proof.
pub struct ServerSession {
    key: [u8; KEY_SIZE],
    token: [u8; TOKEN_SIZE],
}

impl ServerSession {
    /// Handle the client's opening session field and produce the
    /// reply: server pubkey followed by the sealed token.
    pub fn respond(
        keys: &KeyPair,
        client_session: &[u8; SESSION_SIZE],
        verifier: &[u8; VERIFIER_SIZE],
    ) -> anyhow::Result<(ServerSession, [u8; SESSION_SIZE])> {
        let mut client_public = [0u8; KEY_SIZE];
        client_public.copy_from_slice(&client_session[..KEY_SIZE]);
        let shared = keys.secret.diffie_hellman(&PublicKey::from(client_public));

        let server_public = keys.public_bytes();
        let key = agreed_key(shared.as_bytes(), verifier, client_session, &server_public);

        let mut token = [0u8; TOKEN_SIZE];
        OsRng.fill_bytes(&mut token);
        let sealed = seal_with(&key, &NONCE_TOKEN, &token)?;

        let mut reply = [0u8; SESSION_SIZE];
        reply[..KEY_SIZE].copy_from_slice(&server_public);
        reply[KEY_SIZE..].copy_from_slice(&sealed);

        Ok((ServerSession { key, token }, reply))
    }

    /// Check the client's proof. Success yields the session key;
    /// failure consumes the session so it cannot be retried.
    pub fn verify(self, proof_session: &[u8; SESSION_SIZE]) -> anyhow::Result<SessionKey> {
        let proof = open_with(&self.key, &NONCE_PROOF, &proof_session[..SEALED_TOKEN_SIZE])
            .context("opening session proof")?;
        if proof.len() != TOKEN_SIZE || !bool::from(proof.as_slice().ct_eq(&self.token)) {
            return Err(anyhow!("session proof does not match the issued token"));
        }
        Ok(SessionKey { key: self.key })
    }
}

/// Client side of the exchange.
pub struct ClientSession {
    secret: StaticSecret,
    session: [u8; SESSION_SIZE],
}

impl ClientSession {
    /// Build the opening session field: an ephemeral public key and
    /// 32 random bytes that bind the exchange.
    pub fn start() -> (ClientSession, [u8; SESSION_SIZE]) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut session = [0u8; SESSION_SIZE];
        session[..KEY_SIZE].copy_from_slice(public.as_bytes());
        OsRng.fill_bytes(&mut session[KEY_SIZE..]);

        (ClientSession { secret, session }, session)
    }

    /// Authorize the server's reply: derive the agreed key, open the
    /// token, and produce the proof session field.
    pub fn authorize(
        self,
        server_session: &[u8; SESSION_SIZE],
        verifier: &[u8; VERIFIER_SIZE],
    ) -> anyhow::Result<(SessionKey, [u8; SESSION_SIZE])> {
        let mut server_public = [0u8; KEY_SIZE];
        server_public.copy_from_slice(&server_session[..KEY_SIZE]);
        let shared = self.secret.diffie_hellman(&PublicKey::from(server_public));

        let key = agreed_key(shared.as_bytes(), verifier, &self.session, &server_public);

        let token = open_with(&key, &NONCE_TOKEN, &server_session[KEY_SIZE..])
            .context("opening server token (wrong password?)")?;
        let sealed = seal_with(&key, &NONCE_PROOF, &token)?;

        let mut proof = [0u8; SESSION_SIZE];
        proof[..SEALED_TOKEN_SIZE].copy_from_slice(&sealed);

        Ok((SessionKey { key }, proof))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handshake(
        server_pw: &str,
        client_pw: &str,
    ) -> anyhow::Result<(SessionKey, SessionKey)> {
        let keys = KeyPair::generate();
        let server_verifier = derive_verifier("alice", server_pw)?;
        let client_verifier = derive_verifier("alice", client_pw)?;

        let (client, client_session) = ClientSession::start();
        let (server, server_session) =
            ServerSession::respond(&keys, &client_session, &server_verifier)?;
        let (client_key, proof) = client.authorize(&server_session, &client_verifier)?;
        let server_key = server.verify(&proof)?;
        Ok((client_key, server_key))
    }

    #[test]
    fn handshake_agrees_on_a_key() {
        let (client_key, server_key) = handshake("hunter2", "hunter2").expect("handshake");

        let sealed = client_key.seal(7, DIR_CLIENT, b"echo hi").expect("seal");
        let opened = server_key.open(7, DIR_CLIENT, &sealed).expect("open");
        assert_eq!(opened, b"echo hi");

        // and the reply direction under the next counter
        let sealed = server_key.seal(8, DIR_DAEMON, b"ok").expect("seal");
        let opened = client_key.open(8, DIR_DAEMON, &sealed).expect("open");
        assert_eq!(opened, b"ok");
    }

    #[test]
    fn wrong_password_fails_closed() {
        assert!(handshake("hunter2", "hunter3").is_err());
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let keys = KeyPair::generate();
        let verifier = derive_verifier("alice", "hunter2").expect("verifier");

        let (client, client_session) = ClientSession::start();
        let (server, server_session) =
            ServerSession::respond(&keys, &client_session, &verifier).expect("respond");
        let (_, mut proof) = client.authorize(&server_session, &verifier).expect("authorize");
        proof[0] ^= 0x55;
        assert!(server.verify(&proof).is_err());
    }

    #[test]
    fn nonce_reuse_across_directions_is_distinct() {
        let (client_key, server_key) = handshake("pw", "pw").expect("handshake");
        let sealed = client_key.seal(1, DIR_CLIENT, b"payload").expect("seal");
        // same counter, wrong direction: must not open
        assert!(server_key.open(1, DIR_DAEMON, &sealed).is_err());
    }

    #[test]
    fn verifier_is_deterministic_per_user() {
        let a = derive_verifier("alice", "pw").expect("verifier");
        let b = derive_verifier("alice", "pw").expect("verifier");
        let c = derive_verifier("bob", "pw").expect("verifier");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
