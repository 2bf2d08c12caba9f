//! Buffered random access to the reference genome.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use bio::io::fasta;
use lru_time_cache::LruCache;
use serde::{Deserialize, Serialize};

use crate::errors;
use crate::genome::{Contig, GenomicRegion};

/// What to do with IUPAC ambiguity codes in fetched sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmbiguityPolicy {
    /// Return the sequence as stored.
    Maintain,
    /// Replace every non-ACGT base with N.
    Disambiguate,
    /// Fail on any non-ACGTN base.
    Throw,
}

impl Default for AmbiguityPolicy {
    fn default() -> Self {
        AmbiguityPolicy::Maintain
    }
}

enum Backend {
    Indexed {
        reader: RwLock<fasta::IndexedReader<fs::File>>,
        cache: Mutex<LruCache<String, Arc<Vec<u8>>>>,
    },
    InMemory(HashMap<String, Arc<Vec<u8>>>),
}

/// A lazy, contig-granular buffer over an indexed FASTA file. Whole contigs
/// are cached so repeated window lookups within one contig are O(window).
pub struct Reference {
    backend: Backend,
    contigs: Vec<Contig>,
    ambiguity: AmbiguityPolicy,
    path: Option<PathBuf>,
}

impl Reference {
    pub fn from_path<P: AsRef<Path> + std::fmt::Debug>(
        path: P,
        cache_capacity: usize,
        ambiguity: AmbiguityPolicy,
    ) -> Result<Self> {
        let reader = fasta::IndexedReader::from_file(&path).map_err(|e| {
            errors::Error::MalformedFile {
                path: path.as_ref().to_owned(),
                msg: e.to_string(),
            }
        })?;
        let contigs = reader
            .index
            .sequences()
            .iter()
            .enumerate()
            .map(|(index, seq)| Contig {
                name: seq.name.clone(),
                size: seq.len,
                index,
            })
            .collect();
        Ok(Reference {
            backend: Backend::Indexed {
                reader: RwLock::new(reader),
                cache: Mutex::new(LruCache::with_capacity(cache_capacity)),
            },
            contigs,
            ambiguity,
            path: Some(path.as_ref().to_owned()),
        })
    }

    /// Build from sequences already in memory. Used by small runs and tests.
    pub fn from_sequences<I>(sequences: I, ambiguity: AmbiguityPolicy) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let mut contigs = Vec::new();
        let mut map = HashMap::new();
        for (index, (name, sequence)) in sequences.into_iter().enumerate() {
            contigs.push(Contig {
                name: name.clone(),
                size: sequence.len() as u64,
                index,
            });
            map.insert(name, Arc::new(sequence));
        }
        Reference {
            backend: Backend::InMemory(map),
            contigs,
            ambiguity,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn contigs(&self) -> &[Contig] {
        &self.contigs
    }

    pub fn contig(&self, name: &str) -> Result<&Contig> {
        self.contigs
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                errors::Error::UnknownContig {
                    contig: name.to_owned(),
                }
                .into()
            })
    }

    pub fn contig_region(&self, name: &str) -> Result<GenomicRegion> {
        let contig = self.contig(name)?;
        Ok(GenomicRegion::new(contig.name.clone(), 0, contig.size))
    }

    fn contig_sequence(&self, name: &str) -> Result<Arc<Vec<u8>>> {
        match &self.backend {
            Backend::InMemory(map) => map.get(name).cloned().ok_or_else(|| {
                errors::Error::UnknownContig {
                    contig: name.to_owned(),
                }
                .into()
            }),
            Backend::Indexed { reader, cache } => {
                let mut cache = cache.lock().unwrap();
                if let Some(sequence) = cache.get(name) {
                    return Ok(Arc::clone(sequence));
                }
                let mut sequence = Vec::new();
                {
                    let mut reader = reader.write().unwrap();
                    reader.fetch_all(name)?;
                    reader.read(&mut sequence)?;
                }
                let sequence = Arc::new(sequence);
                cache.insert(name.to_owned(), Arc::clone(&sequence));
                Ok(sequence)
            }
        }
    }

    /// Fetch the reference bases over the given window, applying the
    /// configured ambiguity policy.
    pub fn fetch(&self, region: &GenomicRegion) -> Result<Vec<u8>> {
        let sequence = self.contig_sequence(region.contig())?;
        let (begin, end) = (region.begin() as usize, region.end() as usize);
        if end > sequence.len() {
            return Err(errors::Error::ReferenceLookupOutOfBounds {
                contig: region.contig().to_owned(),
                begin: region.begin(),
                end: region.end(),
            }
            .into());
        }
        let mut result = sequence[begin..end].to_vec();
        match self.ambiguity {
            AmbiguityPolicy::Maintain => {}
            AmbiguityPolicy::Disambiguate => {
                for base in result.iter_mut() {
                    if !matches!(base.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T') {
                        *base = b'N';
                    }
                }
            }
            AmbiguityPolicy::Throw => {
                if let Some(base) = result
                    .iter()
                    .find(|b| !matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N'))
                {
                    return Err(errors::Error::AmbiguousReferenceBase {
                        contig: region.contig().to_owned(),
                        base: *base as char,
                    }
                    .into());
                }
            }
        }
        Ok(result)
    }

    /// The single base at the begin position of the region.
    pub fn fetch_base(&self, region: &GenomicRegion) -> Result<u8> {
        let base = self.fetch(&region.head_position())?;
        Ok(base[0])
    }
}
