use std::path::PathBuf;

use thiserror::Error;

use crate::constants::MIN_THREAD_COUNT;

#[derive(Error, Debug)]
pub enum Error {
    /* ==================== Configuration errors ==================== */
    #[error("no sample named {name} in the given read files")]
    UnknownSample { name: String },
    #[error("contig {contig} is not present in the reference")]
    UnknownContig { contig: String },
    #[error("invalid region specification '{spec}'; use CHROM[:BEGIN[-END]] syntax")]
    InvalidRegionSpec { spec: String },
    #[error("invalid contig ploidy specification '{spec}'; use CONTIG=PLOIDY syntax")]
    InvalidContigPloidy { spec: String },
    #[error(
        "invalid thread count: must be at least {}, got {count}",
        MIN_THREAD_COUNT
    )]
    InvalidThreadCount { count: usize },
    #[error("conflicting options: {msg}")]
    ConflictingOptions { msg: String },
    #[error("the {role} sample must be specified for the {caller} caller")]
    MissingSampleRole { role: String, caller: String },
    #[error(
        "trio calling with ploidy {ploidy} is not supported (maximum {max}); \
         use the population caller instead"
    )]
    BadPloidy { ploidy: usize, max: usize },
    #[error("at least one sample must have positive ploidy")]
    AllPloidiesZero,
    #[error("the child must inherit at least one haplotype if both parents have zygosity")]
    ChildPloidyZero,

    /* ======================== I/O errors ========================== */
    #[error("malformed or unreadable file {path}: {msg}")]
    MalformedFile { path: PathBuf, msg: String },
    #[error("reference lookup of {contig}:{begin}-{end} is out of bounds")]
    ReferenceLookupOutOfBounds { contig: String, begin: u64, end: u64 },
    #[error("reference sequence for {contig} contains the ambiguous base '{base}'")]
    AmbiguousReferenceBase { contig: String, base: char },
    #[error("candidate variant file is not sorted: {previous} > {current}")]
    UnsortedCandidateFile { previous: String, current: String },

    /* ================== Per-region recoverable ==================== */
    #[error("assembly failed for all k-mer sizes in {region}")]
    AssemblyFailed { region: String },
    #[error("posterior normalisation produced non-finite values in {region}")]
    NonFinitePosterior { region: String },

    /* =================== Invariant violations ===================== */
    #[error(
        "inconsistent call in sample {sample}: alleles {first} and {second} were both called"
    )]
    InconsistentCall {
        sample: String,
        first: String,
        second: String,
    },
}
