//! Reversible payload transforms.
//!
//! A [`Transform`] is registered once in a [`TransformRegistry`]; variables only
//! keep the [`TransformHandle`] and their own parameters. The registry is shared
//! (`Arc`) between IO contexts and engines, and the transform name is what ends up
//! in the stream, so a reader resolves it against its own registry.

use std::fmt;
use std::sync::Arc;

use crate::{Error, Params, Result};

mod compression;

pub use compression::Compression;

pub trait Transform: Send + Sync {
    /// Name written into the stream metadata for every payload this transform touched.
    fn name(&self) -> &str;

    fn encode(&self, input: &[u8], params: &Params) -> Result<Vec<u8>>;

    /// `decoded_size` is the size of the input this stage saw when encoding.
    fn decode(&self, input: &[u8], params: &Params, decoded_size: usize) -> Result<Vec<u8>>;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TransformHandle(u32);

impl TransformHandle {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
pub struct TransformRegistry {
    transforms: Vec<Arc<dyn Transform>>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.transforms.iter().map(|t| t.name()))
            .finish()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the compression transforms this build supports.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for compression in Compression::available() {
            // Builtin names are distinct, registering cannot fail.
            let _ = registry.register(Arc::new(*compression));
        }
        registry
    }

    pub fn register(&mut self, transform: Arc<dyn Transform>) -> Result<TransformHandle> {
        if self.find(transform.name()).is_some() {
            return Err(Error::InvalidArgument(format!(
                "transform '{}' is already registered",
                transform.name()
            )));
        }

        self.transforms.push(transform);
        Ok(TransformHandle((self.transforms.len() - 1) as u32))
    }

    pub fn find(&self, name: &str) -> Option<TransformHandle> {
        self.transforms
            .iter()
            .position(|t| t.name() == name)
            .map(|i| TransformHandle(i as u32))
    }

    pub fn get(&self, handle: TransformHandle) -> Result<&Arc<dyn Transform>> {
        self.transforms
            .get(handle.get())
            .ok_or(Error::OutOfRange {
                index: handle.get(),
                len: self.transforms.len(),
            })
    }

    pub fn by_name(&self, name: &str) -> Result<&Arc<dyn Transform>> {
        match self.find(name) {
            Some(handle) => self.get(handle),
            None => Err(Error::NotFound(format!("transform {}", name))),
        }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

/// How one transform stage was applied to a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRecord {
    pub name: String,
    pub params: Params,
    /// Size of the input this stage consumed.
    pub input_size: u64,
    /// Size of the output this stage produced.
    pub output_size: u64,
}

/// Runs `stages` in order over `input`.
pub(crate) fn encode_chain(
    registry: &TransformRegistry,
    stages: &[(TransformHandle, Params)],
    input: Vec<u8>,
) -> Result<(Vec<u8>, Vec<TransformRecord>)> {
    let mut records = Vec::with_capacity(stages.len());
    let mut data = input;

    for (handle, params) in stages {
        let transform = registry.get(*handle)?;
        let encoded = transform.encode(&data, params)?;
        records.push(TransformRecord {
            name: transform.name().to_string(),
            params: params.clone(),
            input_size: data.len() as u64,
            output_size: encoded.len() as u64,
        });
        data = encoded;
    }

    Ok((data, records))
}

/// Undoes `records` in reverse order.
pub(crate) fn decode_chain(
    registry: &TransformRegistry,
    records: &[TransformRecord],
    input: Vec<u8>,
) -> Result<Vec<u8>> {
    let mut data = input;

    for record in records.iter().rev() {
        let transform = registry.by_name(&record.name)?;
        if data.len() as u64 != record.output_size {
            return Err(Error::InvalidFormat(format!(
                "transform {} expected {} encoded bytes, found {}",
                record.name,
                record.output_size,
                data.len()
            )));
        }
        data = transform.decode(&data, &record.params, record.input_size as usize)?;
        if data.len() as u64 != record.input_size {
            return Err(Error::InvalidFormat(format!(
                "transform {} decoded {} bytes, expected {}",
                record.name,
                data.len(),
                record.input_size
            )));
        }
    }

    Ok(data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// XORs every byte with the `key` parameter.
    pub(crate) struct Xor;

    impl Transform for Xor {
        fn name(&self) -> &str {
            "xor"
        }

        fn encode(&self, input: &[u8], params: &Params) -> Result<Vec<u8>> {
            let key = params
                .get("key")
                .and_then(|k| k.parse::<u8>().ok())
                .unwrap_or(0x5a);
            Ok(input.iter().map(|b| b ^ key).collect())
        }

        fn decode(&self, input: &[u8], params: &Params, _: usize) -> Result<Vec<u8>> {
            self.encode(input, params)
        }
    }

    /// Reverses the payload and appends a length trailer, so sizes change between stages.
    pub(crate) struct Reverse;

    impl Transform for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }

        fn encode(&self, input: &[u8], _: &Params) -> Result<Vec<u8>> {
            let mut out: Vec<u8> = input.iter().rev().copied().collect();
            out.extend_from_slice(&(input.len() as u32).to_le_bytes());
            Ok(out)
        }

        fn decode(&self, input: &[u8], _: &Params, decoded_size: usize) -> Result<Vec<u8>> {
            if input.len() != decoded_size + 4 {
                return Err(Error::InvalidFormat("bad reverse trailer".into()));
            }
            Ok(input[..decoded_size].iter().rev().copied().collect())
        }
    }

    pub(crate) fn test_registry() -> (TransformRegistry, TransformHandle, TransformHandle) {
        let mut registry = TransformRegistry::new();
        let xor = registry.register(Arc::new(Xor)).unwrap();
        let reverse = registry.register(Arc::new(Reverse)).unwrap();
        (registry, xor, reverse)
    }

    fn payload() -> Vec<u8> {
        (0..=255u8).cycle().take(1000).collect()
    }

    #[test]
    fn empty_chain_is_identity() {
        let (registry, _, _) = test_registry();
        let (encoded, records) = encode_chain(&registry, &[], payload()).unwrap();
        assert!(records.is_empty());
        assert_eq!(encoded, payload());
        assert_eq!(decode_chain(&registry, &records, encoded).unwrap(), payload());
    }

    #[test]
    fn single_stage_round_trip() {
        let (registry, xor, _) = test_registry();
        let stages = vec![(xor, Params::new())];
        let (encoded, records) = encode_chain(&registry, &stages, payload()).unwrap();
        assert_ne!(encoded, payload());
        assert_eq!(decode_chain(&registry, &records, encoded).unwrap(), payload());
    }

    #[test]
    fn three_stage_round_trip() {
        let (registry, xor, reverse) = test_registry();
        let mut key = Params::new();
        key.insert("key".into(), "7".into());
        let stages = vec![
            (xor, Params::new()),
            (reverse, Params::new()),
            (xor, key),
        ];
        let (encoded, records) = encode_chain(&registry, &stages, payload()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].input_size, 1000);
        assert_eq!(records[1].output_size, 1004);
        assert_eq!(encoded.len(), 1004);
        assert_eq!(decode_chain(&registry, &records, encoded).unwrap(), payload());
    }

    #[test]
    fn duplicate_names_rejected() {
        let (mut registry, _, _) = test_registry();
        assert!(matches!(
            registry.register(Arc::new(Xor)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_transform_on_decode() {
        let registry = TransformRegistry::new();
        let records = vec![TransformRecord {
            name: "missing".into(),
            params: Params::new(),
            input_size: 1,
            output_size: 1,
        }];
        assert!(matches!(
            decode_chain(&registry, &records, vec![0]),
            Err(Error::NotFound(_))
        ));
    }
}
