//! Crate-wide defaults. Command line options override these.

/// Hard cap on emitted record qualities (PHRED).
pub const MAX_QUAL: f64 = 5000.0;

/// Cap on per-sample genotype qualities (PHRED).
pub const MAX_GQ: i32 = 999;

/// Cap on per-sample phase qualities (PHRED).
pub const MAX_PQ: i32 = 99;

/// Haplotypes with posterior below this are dropped between caller passes.
pub const MIN_HAPLOTYPE_POSTERIOR: f64 = 1e-15;

pub const DEFAULT_MAX_HAPLOTYPES: usize = 128;
pub const DEFAULT_MAX_GENOTYPES: usize = 10_000;
pub const DEFAULT_MAX_VARIANT_SIZE: u64 = 500;
pub const DEFAULT_MIN_BASE_QUALITY: u8 = 20;
pub const DEFAULT_MIN_SUPPORTING_READS: usize = 2;
pub const DEFAULT_KMER_SIZES: [usize; 3] = [10, 25, 35];
pub const DEFAULT_NUM_FALLBACK_KMERS: usize = 6;
pub const DEFAULT_FALLBACK_KMER_INTERVAL: usize = 10;
pub const DEFAULT_ORGANISM_PLOIDY: usize = 2;
pub const DEFAULT_SOMATIC_MUTATION_RATE: f64 = 1e-4;
pub const DEFAULT_DENOVO_MUTATION_RATE: f64 = 1e-8;
pub const DEFAULT_SNP_HETEROZYGOSITY: f64 = 1e-3;
pub const DEFAULT_INDEL_HETEROZYGOSITY: f64 = 1e-4;

/// Fixed seed for the downsampler so that runs are reproducible.
pub const DOWNSAMPLER_SEED: u64 = 891_106;

/// Ploidies above this are rejected by the trio model.
pub const MAX_TRIO_PLOIDY: usize = 3;

pub const MIN_THREAD_COUNT: usize = 1;
