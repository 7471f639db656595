// In-process security module used by the engine, lifecycle, and facade tests
//
// Implements the wire protocol the way the firmware does: continuation blocks
// are accumulated until the primary block arrives, then the request is
// reassembled and dispatched. Digests and signatures are real (SHA-512 /
// Ed25519) so the end-to-end signing laws can be asserted against it.
// Failure injection covers connect failures and per-block rejection codes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::transport::codec::OpCode;
use crate::transport::{HsmCentral, HsmLink};
use crate::ProxyError;

struct DeviceKey {
    proxy: Vec<u8>,
    signing: SigningKey,
}

impl DeviceKey {
    fn new(proxy: Vec<u8>) -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            proxy,
            signing: SigningKey::from_bytes(&seed),
        }
    }

    fn public(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }
}

#[derive(Default)]
struct DeviceState {
    current: Option<DeviceKey>,
    previous: Option<DeviceKey>,
    pending_blocks: BTreeMap<u8, Vec<u8>>,
    /// Fully reassembled body of the most recent request, for frame-level
    /// assertions in tests.
    last_request: Option<Vec<u8>>,
    fail_connects: u32,
    fail_writes: u32,
    fail_closes: u32,
    reject_code: Option<u8>,
    connects: u32,
    disconnects: u32,
}

/// Test double for the ArmorD peripheral.
#[derive(Clone, Default)]
pub struct MockHsm {
    state: Arc<Mutex<DeviceState>>,
}

impl MockHsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` acquisitions fail at connect time.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().unwrap().fail_connects = count;
    }

    /// Make the next `count` block writes fail with a transport error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().unwrap().fail_writes = count;
    }

    /// Make the next `count` disconnects fail with a transport error.
    pub fn fail_next_closes(&self, count: u32) {
        self.state.lock().unwrap().fail_closes = count;
    }

    /// Answer every block with the given rejection code until cleared.
    pub fn reject_blocks_with(&self, code: Option<u8>) {
        self.state.lock().unwrap().reject_code = code;
    }

    /// Public key of the device's current key pair, if any.
    pub fn current_public(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().current.as_ref().map(DeviceKey::public)
    }

    /// Whether the device still holds a superseded key pair.
    pub fn holds_previous(&self) -> bool {
        self.state.lock().unwrap().previous.is_some()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.state.lock().unwrap().disconnects
    }

    /// Reassembled body of the most recent request.
    pub fn last_request(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().last_request.clone()
    }
}

#[async_trait]
impl HsmCentral for MockHsm {
    async fn acquire(&self) -> Result<Box<dyn HsmLink>, ProxyError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ProxyError::Transport(
                "simulated connect failure".to_string(),
            ));
        }
        state.connects += 1;
        state.pending_blocks.clear();
        drop(state);
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MockLink {
    state: Arc<Mutex<DeviceState>>,
    open: bool,
}

#[async_trait]
impl HsmLink for MockLink {
    async fn write_block(&mut self, block: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let mut state = self.state.lock().unwrap();
        assert!(self.open, "write on a closed link");

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(ProxyError::Transport("simulated write failure".to_string()));
        }
        if let Some(code) = state.reject_code {
            return Ok(vec![code]);
        }

        if block.len() >= 2 && block[0] == 0x00 {
            // Continuation block: stash the body bytes until the primary
            // block arrives.
            state.pending_blocks.insert(block[1], block[2..].to_vec());
            return Ok(vec![0]);
        }

        let mut body = block.to_vec();
        let extras = std::mem::take(&mut state.pending_blocks);
        for (_, bytes) in extras {
            body.extend_from_slice(&bytes);
        }
        state.last_request = Some(body.clone());
        Ok(state.dispatch(&body))
    }

    async fn close(&mut self) -> Result<(), ProxyError> {
        self.open = false;
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(ProxyError::Transport("simulated disconnect failure".to_string()));
        }
        Ok(())
    }
}

impl DeviceState {
    fn dispatch(&mut self, body: &[u8]) -> Vec<u8> {
        const BAD_REQUEST: u8 = 2;
        const BAD_KEY: u8 = 3;

        let Some(op) = body.first().copied().and_then(OpCode::from_value) else {
            return vec![BAD_REQUEST];
        };
        let Some(args) = parse_arguments(body) else {
            return vec![BAD_REQUEST];
        };

        match op {
            OpCode::GenerateKeys => {
                let [proxy] = args.as_slice() else {
                    return vec![BAD_REQUEST];
                };
                let key = DeviceKey::new(proxy.clone());
                let public = key.public();
                self.current = Some(key);
                self.previous = None;
                public
            }
            OpCode::RotateKeys => {
                let [previous_proxy, new_proxy] = args.as_slice() else {
                    return vec![BAD_REQUEST];
                };
                match self.current.take() {
                    Some(current) if current.proxy == *previous_proxy => {
                        let key = DeviceKey::new(new_proxy.clone());
                        let public = key.public();
                        self.previous = Some(current);
                        self.current = Some(key);
                        public
                    }
                    other => {
                        self.current = other;
                        vec![BAD_KEY]
                    }
                }
            }
            OpCode::EraseKeys => {
                self.current = None;
                self.previous = None;
                vec![1]
            }
            OpCode::DigestBytes => {
                let [bytes] = args.as_slice() else {
                    return vec![BAD_REQUEST];
                };
                Sha512::digest(bytes).to_vec()
            }
            OpCode::SignBytes => {
                let [proxy, bytes] = args.as_slice() else {
                    return vec![BAD_REQUEST];
                };
                // A signature under the superseded key consumes it.
                if self.previous.as_ref().is_some_and(|key| key.proxy == *proxy) {
                    let key = self.previous.take().unwrap();
                    return key.signing.sign(bytes).to_bytes().to_vec();
                }
                match &self.current {
                    Some(key) if key.proxy == *proxy => {
                        key.signing.sign(bytes).to_bytes().to_vec()
                    }
                    _ => vec![BAD_KEY],
                }
            }
            OpCode::ValidSignature => {
                let [public, signature, bytes] = args.as_slice() else {
                    return vec![BAD_REQUEST];
                };
                vec![verify_signature(public, signature, bytes) as u8]
            }
        }
    }
}

fn parse_arguments(body: &[u8]) -> Option<Vec<Vec<u8>>> {
    if body.len() < 2 {
        return if body.len() == 1 { Some(Vec::new()) } else { None };
    }
    let count = body[1] as usize;
    let mut args = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let len_bytes: [u8; 2] = body.get(offset..offset + 2)?.try_into().ok()?;
        let len = u16::from_be_bytes(len_bytes) as usize;
        offset += 2;
        args.push(body.get(offset..offset + len)?.to_vec());
        offset += len;
    }
    if offset != body.len() {
        return None;
    }
    Some(args)
}

fn verify_signature(public: &[u8], signature: &[u8], bytes: &[u8]) -> bool {
    let Ok(public): Result<[u8; 32], _> = public.try_into() else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature): Result<[u8; 64], _> = signature.try_into() else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    verifying.verify(bytes, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::{encode_request, split_blocks};

    async fn exchange(hsm: &MockHsm, op: OpCode, args: &[&[u8]]) -> Vec<u8> {
        let body = encode_request(op, args).unwrap();
        let blocks = split_blocks(&body);
        let mut link = hsm.acquire().await.unwrap();
        let (primary, extras) = blocks.split_last().unwrap();
        for block in extras {
            link.write_block(block).await.unwrap();
        }
        let response = link.write_block(primary).await.unwrap();
        link.close().await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_digest_is_sha512() {
        let hsm = MockHsm::new();
        let digest = exchange(&hsm, OpCode::DigestBytes, &[b"abc"]).await;
        assert_eq!(digest, Sha512::digest(b"abc").to_vec());
    }

    #[tokio::test]
    async fn test_generate_sign_verify_loop() {
        let hsm = MockHsm::new();
        let proxy = [0x11u8; 32];

        let public = exchange(&hsm, OpCode::GenerateKeys, &[&proxy]).await;
        assert_eq!(public.len(), 32);

        let signature = exchange(&hsm, OpCode::SignBytes, &[&proxy, b"message"]).await;
        assert_eq!(signature.len(), 64);

        let valid =
            exchange(&hsm, OpCode::ValidSignature, &[&public, &signature, b"message"]).await;
        assert_eq!(valid, vec![1]);

        let invalid =
            exchange(&hsm, OpCode::ValidSignature, &[&public, &signature, b"other"]).await;
        assert_eq!(invalid, vec![0]);
    }

    #[tokio::test]
    async fn test_sign_with_unknown_proxy_is_rejected() {
        let hsm = MockHsm::new();
        exchange(&hsm, OpCode::GenerateKeys, &[&[0x11; 32]]).await;

        let response = exchange(&hsm, OpCode::SignBytes, &[&[0x99; 32], b"m"]).await;
        assert_eq!(response, vec![3]);
    }

    #[tokio::test]
    async fn test_multi_block_request_reassembly() {
        let hsm = MockHsm::new();
        let bytes = vec![0x5Au8; 1200];
        let digest = exchange(&hsm, OpCode::DigestBytes, &[&bytes]).await;
        assert_eq!(digest, Sha512::digest(&bytes).to_vec());

        let body = encode_request(OpCode::DigestBytes, &[&bytes]).unwrap();
        assert_eq!(hsm.last_request(), Some(body));
    }

    #[tokio::test]
    async fn test_rotation_consumes_previous_on_sign() {
        let hsm = MockHsm::new();
        let first = [0x01u8; 32];
        let second = [0x02u8; 32];

        exchange(&hsm, OpCode::GenerateKeys, &[&first]).await;
        exchange(&hsm, OpCode::RotateKeys, &[&first, &second]).await;
        assert!(hsm.holds_previous());

        let signature = exchange(&hsm, OpCode::SignBytes, &[&first, b"m"]).await;
        assert_eq!(signature.len(), 64);
        assert!(!hsm.holds_previous());

        // The superseded key is gone; only the current proxy signs now.
        let rejected = exchange(&hsm, OpCode::SignBytes, &[&first, b"m"]).await;
        assert_eq!(rejected, vec![3]);
    }
}
