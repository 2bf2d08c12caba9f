//! The read fetch pipeline: fetch, filter, sort, deduplicate, transform,
//! downsample.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;
use rust_htslib::bam::{self, Read};

use crate::errors;
use crate::genome::GenomicRegion;
use crate::reads::filters::ReadFilters;
use crate::reads::transforms::ReadTransforms;
use crate::reads::{AlignedRead, Downsampler};
use crate::SampleName;

/// Caps the number of simultaneously open read files.
pub struct FileSemaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl FileSemaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(FileSemaphore {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>) -> FilePermit {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
        FilePermit {
            semaphore: Arc::clone(self),
        }
    }
}

pub struct FilePermit {
    semaphore: Arc<FileSemaphore>,
}

impl Drop for FilePermit {
    fn drop(&mut self) {
        let mut permits = self.semaphore.permits.lock().unwrap();
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

/// Rough per-read memory estimate used for buffer budgeting.
const APPROX_BYTES_PER_READ: usize = 500;

#[derive(Clone)]
pub struct ReadPipeConfig {
    pub filters: ReadFilters,
    pub transforms: ReadTransforms,
    pub downsampler: Option<Downsampler>,
    /// Split fetch windows so the fetched-read buffer stays near this size.
    pub target_read_buffer_size: Option<usize>,
}

impl Default for ReadPipeConfig {
    fn default() -> Self {
        ReadPipeConfig {
            filters: ReadFilters::standard(20),
            transforms: ReadTransforms::standard(),
            downsampler: None,
            target_read_buffer_size: None,
        }
    }
}

/// One read source per sample plus the shared preparation stages.
pub struct ReadPipe {
    sources: Vec<(SampleName, PathBuf)>,
    semaphore: Arc<FileSemaphore>,
    config: ReadPipeConfig,
}

pub type ReadMap = HashMap<SampleName, Vec<AlignedRead>>;

impl ReadPipe {
    pub fn new(
        sources: Vec<(SampleName, PathBuf)>,
        max_open_read_files: usize,
        config: ReadPipeConfig,
    ) -> Self {
        ReadPipe {
            sources,
            semaphore: FileSemaphore::new(max_open_read_files),
            config,
        }
    }

    pub fn samples(&self) -> Vec<SampleName> {
        self.sources.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Fetch the prepared reads of every sample over `region`.
    pub fn fetch_reads(&self, region: &GenomicRegion) -> Result<ReadMap> {
        let mut result = ReadMap::new();
        for (sample, path) in &self.sources {
            let mut reads = self.fetch_sample(path, region)?;
            self.prepare(&mut reads, region);
            result.insert(sample.clone(), reads);
        }
        Ok(result)
    }

    fn fetch_sample(&self, path: &PathBuf, region: &GenomicRegion) -> Result<Vec<AlignedRead>> {
        let _permit = self.semaphore.acquire();
        let mut reader =
            bam::IndexedReader::from_path(path).map_err(|e| errors::Error::MalformedFile {
                path: path.clone(),
                msg: e.to_string(),
            })?;
        let tid = reader
            .header()
            .tid(region.contig().as_bytes())
            .ok_or_else(|| errors::Error::UnknownContig {
                contig: region.contig().to_owned(),
            })?;
        let windows = self.split_for_buffer(region);
        let mut reads = Vec::new();
        for window in windows {
            reader
                .fetch((tid, window.begin(), window.end()))
                .map_err(|e| errors::Error::MalformedFile {
                    path: path.clone(),
                    msg: e.to_string(),
                })?;
            for record in reader.records() {
                let record = record.map_err(|e| errors::Error::MalformedFile {
                    path: path.clone(),
                    msg: e.to_string(),
                })?;
                if record.is_unmapped() {
                    continue;
                }
                let read = AlignedRead::from_record(region.contig(), &record);
                // window splitting must not duplicate boundary overlaps
                if read.region().begin() >= window.begin() || window.begin() == region.begin() {
                    reads.push(read);
                }
            }
        }
        Ok(reads)
    }

    /// Sub-windows sized so each fetch stays within the read buffer budget.
    fn split_for_buffer(&self, region: &GenomicRegion) -> Vec<GenomicRegion> {
        let budget = match self.config.target_read_buffer_size {
            Some(bytes) => bytes,
            None => return vec![region.clone()],
        };
        // assume short-read coverage ~100x as the worst case for splitting
        let reads_per_bp = 1;
        let max_window = (budget / (APPROX_BYTES_PER_READ * reads_per_bp)).max(1000) as u64;
        if region.size() <= max_window {
            return vec![region.clone()];
        }
        let mut windows = Vec::new();
        let mut begin = region.begin();
        while begin < region.end() {
            let end = (begin + max_window).min(region.end());
            windows.push(GenomicRegion::new(region.contig().to_owned(), begin, end));
            begin = end;
        }
        windows
    }

    fn prepare(&self, reads: &mut Vec<AlignedRead>, region: &GenomicRegion) {
        self.config.filters.retain(reads);
        reads.sort();
        reads.dedup_by(|a, b| {
            a.region() == b.region() && a.name() == b.name() && a.flags() == b.flags()
        });
        self.config.transforms.apply(reads);
        if let Some(downsampler) = &self.config.downsampler {
            let removed = downsampler.downsample(reads);
            if removed > 0 {
                debug!("downsampled {} reads in {}", removed, region);
            }
        }
        if reads.is_empty() {
            warn!("no reads left in {} after filtering", region);
        }
    }
}
