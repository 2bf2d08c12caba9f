//! Command line interface and run orchestration.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use crate::calling::caller::{Caller, CallerParameters, CallerParametersBuilder, RefCallType};
use crate::calling::cancer::{CancerCallerParameters, CancerCallerStrategy};
use crate::calling::individual::{IndividualCallerParameters, IndividualCallerStrategy};
use crate::calling::output::VcfWriter;
use crate::calling::population::{PopulationCallerParameters, PopulationCallerStrategy};
use crate::calling::record_factory::VcfRecord;
use crate::calling::trio::{TrioCallerParameters, TrioCallerStrategy};
use crate::calling::CallerStrategy;
use crate::candidates::{CandidateGenerator, CandidateGeneratorConfig};
use crate::errors;
use crate::genome::{ContigOrder, GenomicRegion};
use crate::model::priors::{CoalescentModel, GenotypePriorModel};
use crate::model::trio::TrioPloidies;
use crate::reads::filters::{ReadFilter, ReadFilters};
use crate::reads::pipe::{ReadPipe, ReadPipeConfig};
use crate::reads::transforms::ReadTransforms;
use crate::reads::Downsampler;
use crate::reference::{AmbiguityPolicy, Reference};
use crate::utils::worker_pool::{worker_pool, Orderable};
use crate::SampleName;

#[derive(Debug, StructOpt, Serialize, Deserialize, Clone)]
#[structopt(
    name = "nautilus",
    about = "A haplotype-aware caller for germline and somatic variants."
)]
pub enum Nautilus {
    #[structopt(name = "individual", about = "Call variants in a single sample.")]
    Individual {
        #[structopt(flatten)]
        common: CommonOptions,
    },
    #[structopt(name = "population", about = "Call variants jointly in a cohort.")]
    Population {
        #[structopt(flatten)]
        common: CommonOptions,
    },
    #[structopt(name = "trio", about = "Call germline and de novo variants in a trio.")]
    Trio {
        #[structopt(flatten)]
        common: CommonOptions,
        #[structopt(long = "maternal-sample", help = "Sample name of the mother.")]
        maternal_sample: String,
        #[structopt(long = "paternal-sample", help = "Sample name of the father.")]
        paternal_sample: String,
        #[structopt(
            long = "denovo-mutation-rate",
            default_value = "1e-8",
            help = "Expected de novo mutation rate per base."
        )]
        denovo_mutation_rate: f64,
        #[structopt(
            long = "min-denovo-posterior",
            default_value = "13",
            help = "Minimum PHRED posterior to report a de novo call."
        )]
        min_denovo_posterior: f64,
    },
    #[structopt(name = "cancer", about = "Call germline and somatic variants in tumour samples.")]
    Cancer {
        #[structopt(flatten)]
        common: CommonOptions,
        #[structopt(long = "normal-sample", help = "Sample name of the matched normal.")]
        normal_sample: Option<String>,
        #[structopt(
            long = "somatic-mutation-rate",
            default_value = "1e-4",
            help = "Expected somatic mutation rate per base."
        )]
        somatic_mutation_rate: f64,
        #[structopt(
            long = "min-somatic-posterior",
            default_value = "10",
            help = "Minimum PHRED posterior to report a somatic call."
        )]
        min_somatic_posterior: f64,
        #[structopt(long = "somatics-only", help = "Only report somatic calls.")]
        somatics_only: bool,
    },
}

#[derive(Debug, StructOpt, Serialize, Deserialize, Clone)]
pub struct CommonOptions {
    #[structopt(parse(from_os_str), help = "Indexed FASTA reference genome.")]
    pub reference: PathBuf,
    #[structopt(
        long = "reads",
        required = true,
        help = "Read files given as SAMPLE=PATH, one per sample."
    )]
    pub reads: Vec<String>,
    #[structopt(long = "output", parse(from_os_str), help = "Output VCF (stdout if omitted).")]
    pub output: Option<PathBuf>,
    #[structopt(long = "regions", help = "Regions to call (CHROM[:BEGIN[-END]]).")]
    pub regions: Vec<String>,
    #[structopt(long = "regions-file", parse(from_os_str))]
    pub regions_file: Option<PathBuf>,
    #[structopt(long = "skip-regions", help = "Regions to skip.")]
    pub skip_regions: Vec<String>,
    #[structopt(long = "skip-regions-file", parse(from_os_str))]
    pub skip_regions_file: Option<PathBuf>,
    #[structopt(
        long = "use-one-based-indexing",
        help = "Interpret region coordinates as one-based inclusive."
    )]
    pub use_one_based_indexing: bool,
    #[structopt(long = "organism-ploidy", default_value = "2")]
    pub organism_ploidy: usize,
    #[structopt(
        long = "contig-ploidies",
        help = "Per-contig ploidy overrides as CONTIG=PLOIDY."
    )]
    pub contig_ploidies: Vec<String>,
    #[structopt(long = "min-variant-posterior", default_value = "2")]
    pub min_variant_posterior: f64,
    #[structopt(long = "min-refcall-posterior", default_value = "2")]
    pub min_refcall_posterior: f64,
    #[structopt(long = "min-phase-score", default_value = "10")]
    pub min_phase_score: f64,
    #[structopt(long = "max-haplotypes", default_value = "128")]
    pub max_haplotypes: usize,
    #[structopt(long = "max-genotypes", default_value = "10000")]
    pub max_genotypes: usize,
    #[structopt(long = "no-raw-cigar-candidates")]
    pub no_raw_cigar_candidates: bool,
    #[structopt(long = "no-assembly-candidates")]
    pub no_assembly_candidates: bool,
    #[structopt(long = "candidates-from-source", parse(from_os_str))]
    pub candidates_from_source: Option<PathBuf>,
    #[structopt(
        long = "regenotype",
        help = "Only genotype variants present in the source call set."
    )]
    pub regenotype: bool,
    #[structopt(long = "kmer-size", help = "Assembler k-mer sizes.")]
    pub kmer_size: Vec<usize>,
    #[structopt(long = "min-base-quality", default_value = "20")]
    pub min_base_quality: u8,
    #[structopt(long = "min-assembler-base-quality", default_value = "10")]
    pub min_assembler_base_quality: u8,
    #[structopt(long = "min-supporting-reads", default_value = "2")]
    pub min_supporting_reads: usize,
    #[structopt(long = "max-variant-size", default_value = "500")]
    pub max_variant_size: u64,
    #[structopt(long = "min-mapping-quality", default_value = "20")]
    pub min_mapping_quality: u8,
    #[structopt(
        long = "good-base-quality",
        default_value = "20",
        help = "Base quality threshold used by the good-base filters."
    )]
    pub good_base_quality: u8,
    #[structopt(
        long = "min-good-bases",
        default_value = "20",
        help = "Minimum number of good-quality bases per read."
    )]
    pub min_good_bases: usize,
    #[structopt(long = "min-read-length")]
    pub min_read_length: Option<usize>,
    #[structopt(long = "max-read-length")]
    pub max_read_length: Option<usize>,
    #[structopt(
        long = "downsample-above",
        default_value = "1000",
        help = "Coverage that triggers downsampling."
    )]
    pub downsample_above: u32,
    #[structopt(
        long = "downsample-target",
        default_value = "500",
        help = "Coverage to downsample to."
    )]
    pub downsample_target: u32,
    #[structopt(long = "max-open-read-files", default_value = "250")]
    pub max_open_read_files: usize,
    #[structopt(long = "target-read-buffer-size")]
    pub target_read_buffer_size: Option<usize>,
    #[structopt(long = "threads", default_value = "1")]
    pub threads: usize,
    #[structopt(long = "sites-only")]
    pub sites_only: bool,
    #[structopt(long = "contig-output-order", default_value = "as-in-reference")]
    pub contig_output_order: ContigOrder,
    #[structopt(long = "refcalls", help = "Emit blocked reference calls.")]
    pub refcalls: bool,
    #[structopt(
        long = "snp-heterozygosity",
        default_value = "1e-3",
        help = "Coalescent prior SNP heterozygosity."
    )]
    pub snp_heterozygosity: f64,
    #[structopt(long = "indel-heterozygosity", default_value = "1e-4")]
    pub indel_heterozygosity: f64,
}

struct RegionOutput {
    index: usize,
    records: Vec<VcfRecord>,
}

impl Orderable for RegionOutput {
    fn index(&self) -> usize {
        self.index
    }
}

pub fn run(options: Nautilus) -> Result<()> {
    match options {
        Nautilus::Individual { common } => {
            let prior = coalescent_prior(&common);
            let parameters = IndividualCallerParameters {
                ploidy: common.organism_ploidy,
                max_genotypes: common.max_genotypes,
                min_variant_posterior: common.min_variant_posterior,
                min_refcall_posterior: common.min_refcall_posterior,
            };
            run_calling(common.clone(), move |samples, ploidy| {
                let sample = samples[0].clone();
                let mut parameters = parameters.clone();
                parameters.ploidy = ploidy;
                Ok(Box::new(IndividualCallerStrategy::new(
                    sample,
                    prior.clone(),
                    parameters,
                )))
            })
        }
        Nautilus::Population { common } => {
            let prior = coalescent_prior(&common);
            let parameters = PopulationCallerParameters {
                ploidy: common.organism_ploidy,
                max_genotypes: common.max_genotypes,
                min_variant_posterior: common.min_variant_posterior,
                min_refcall_posterior: common.min_refcall_posterior,
            };
            run_calling(common.clone(), move |samples, ploidy| {
                let mut parameters = parameters.clone();
                parameters.ploidy = ploidy;
                Ok(Box::new(PopulationCallerStrategy::new(
                    samples.to_vec(),
                    prior.clone(),
                    parameters,
                )))
            })
        }
        Nautilus::Trio {
            common,
            maternal_sample,
            paternal_sample,
            denovo_mutation_rate,
            min_denovo_posterior,
        } => {
            let prior = coalescent_prior(&common);
            let parameters = TrioCallerParameters {
                ploidies: TrioPloidies {
                    maternal: common.organism_ploidy,
                    paternal: common.organism_ploidy,
                    child: common.organism_ploidy,
                },
                max_genotype_combinations: common.max_genotypes,
                min_variant_posterior: common.min_variant_posterior,
                min_denovo_posterior,
                min_refcall_posterior: common.min_refcall_posterior,
                denovo_mutation_rate,
            };
            run_calling(common.clone(), move |samples, ploidy| {
                let mother = find_sample(samples, &maternal_sample)?;
                let father = find_sample(samples, &paternal_sample)?;
                let child = samples
                    .iter()
                    .find(|sample| **sample != mother && **sample != father)
                    .cloned()
                    .ok_or_else(|| errors::Error::MissingSampleRole {
                        role: "child".to_owned(),
                        caller: "trio".to_owned(),
                    })?;
                let mut parameters = parameters.clone();
                parameters.ploidies = TrioPloidies {
                    maternal: ploidy,
                    paternal: ploidy,
                    child: ploidy,
                };
                Ok(Box::new(TrioCallerStrategy::new(
                    mother,
                    father,
                    child,
                    prior.clone(),
                    parameters,
                )?))
            })
        }
        Nautilus::Cancer {
            common,
            normal_sample,
            somatic_mutation_rate,
            min_somatic_posterior,
            somatics_only,
        } => {
            let prior = coalescent_prior(&common);
            let parameters = CancerCallerParameters {
                ploidy: common.organism_ploidy,
                max_genotypes: common.max_genotypes,
                min_variant_posterior: common.min_variant_posterior,
                min_somatic_posterior,
                min_refcall_posterior: common.min_refcall_posterior,
                somatic_mutation_rate,
                call_somatics_only: somatics_only,
            };
            run_calling(common.clone(), move |samples, ploidy| {
                let normal = match &normal_sample {
                    Some(name) => Some(find_sample(samples, name)?),
                    None => None,
                };
                let mut parameters = parameters.clone();
                parameters.ploidy = ploidy;
                Ok(Box::new(CancerCallerStrategy::new(
                    samples.to_vec(),
                    normal,
                    prior.clone(),
                    parameters,
                )))
            })
        }
    }
}

fn coalescent_prior(common: &CommonOptions) -> GenotypePriorModel {
    GenotypePriorModel::Coalescent(CoalescentModel::new(
        common.snp_heterozygosity,
        common.indel_heterozygosity,
    ))
}

fn find_sample(samples: &[SampleName], name: &str) -> Result<SampleName> {
    samples
        .iter()
        .find(|sample| *sample == name)
        .cloned()
        .ok_or_else(|| {
            errors::Error::UnknownSample {
                name: name.to_owned(),
            }
            .into()
        })
}

type StrategyFactory =
    dyn Fn(&[SampleName], usize) -> Result<Box<dyn CallerStrategy + Send>> + Send + Sync;

fn run_calling<F>(common: CommonOptions, make_strategy: F) -> Result<()>
where
    F: Fn(&[SampleName], usize) -> Result<Box<dyn CallerStrategy + Send>> + Send + Sync + 'static,
{
    if common.threads < crate::constants::MIN_THREAD_COUNT {
        return Err(errors::Error::InvalidThreadCount {
            count: common.threads,
        }
        .into());
    }
    let reference = Arc::new(Reference::from_path(
        &common.reference,
        4,
        AmbiguityPolicy::Maintain,
    )?);
    let sources = parse_read_sources(&common.reads)?;
    let samples: Vec<SampleName> = sources.iter().map(|(name, _)| name.clone()).collect();
    let pipe = Arc::new(ReadPipe::new(
        sources,
        common.max_open_read_files,
        read_pipe_config(&common),
    ));
    let contig_ploidies = parse_contig_ploidies(&common.contig_ploidies, &reference)?;
    let regions = resolve_regions(&common, &reference)?;
    info!("calling {} regions with {} threads", regions.len(), common.threads);
    let mut writer = VcfWriter::new(
        common.output.as_deref(),
        reference.contigs(),
        common.contig_output_order,
        &samples,
        common.sites_only,
    )?;
    let (task_sender, task_receiver): (
        Sender<(usize, GenomicRegion)>,
        Receiver<(usize, GenomicRegion)>,
    ) = bounded(regions.len().max(1));
    for task in regions.into_iter().enumerate() {
        task_sender.send(task).expect("task channel closed early");
    }
    drop(task_sender);
    let make_strategy: &StrategyFactory = &make_strategy;
    let workers: Vec<_> = (0..common.threads)
        .map(|_| {
            let reference = Arc::clone(&reference);
            let pipe = Arc::clone(&pipe);
            let common = common.clone();
            let samples = samples.clone();
            let contig_ploidies = contig_ploidies.clone();
            move |receiver: Receiver<(usize, GenomicRegion)>,
                  sender: crossbeam::channel::Sender<RegionOutput>|
                  -> Result<()> {
                for (index, region) in receiver {
                    let ploidy = contig_ploidies
                        .get(region.contig())
                        .copied()
                        .unwrap_or(common.organism_ploidy);
                    let strategy = make_strategy(&samples, ploidy)?;
                    let mut caller = Caller::new(
                        reference.as_ref(),
                        pipe.as_ref(),
                        CandidateGenerator::new(candidate_config(&common)),
                        strategy,
                        caller_parameters(&common)?,
                    );
                    let records = caller.call(&region)?;
                    sender
                        .send(RegionOutput { index, records })
                        .expect("output channel closed early");
                }
                Ok(())
            }
        })
        .collect();
    worker_pool(workers, task_receiver, 64, |output: RegionOutput| {
        for record in &output.records {
            writer.write(record)?;
        }
        Ok(())
    })
}

fn read_pipe_config(common: &CommonOptions) -> ReadPipeConfig {
    let mut filters = vec![
        ReadFilter::IsMapped,
        ReadFilter::MinMappingQuality(common.min_mapping_quality),
        ReadFilter::HasSufficientGoodQualityBases {
            quality: common.good_base_quality,
            count: common.min_good_bases,
        },
        ReadFilter::IsNotMarkedDuplicate,
        ReadFilter::IsNotMarkedQcFail,
        ReadFilter::IsNotSecondary,
        ReadFilter::IsNotSupplementary,
    ];
    if let Some(min) = common.min_read_length {
        filters.push(ReadFilter::MinLength(min));
    }
    if let Some(max) = common.max_read_length {
        filters.push(ReadFilter::MaxLength(max));
    }
    ReadPipeConfig {
        filters: ReadFilters::new(filters),
        transforms: ReadTransforms::standard(),
        downsampler: Some(Downsampler::new(
            common.downsample_above,
            common.downsample_target,
        )),
        target_read_buffer_size: common.target_read_buffer_size,
    }
}

fn candidate_config(common: &CommonOptions) -> CandidateGeneratorConfig {
    CandidateGeneratorConfig {
        raw_cigar_candidates: !common.no_raw_cigar_candidates,
        assembly_candidates: !common.no_assembly_candidates,
        candidates_from_source: common.candidates_from_source.clone(),
        regenotype: common.regenotype,
        min_base_quality: common.min_base_quality,
        min_assembler_base_quality: common.min_assembler_base_quality,
        kmer_sizes: if common.kmer_size.is_empty() {
            crate::constants::DEFAULT_KMER_SIZES.to_vec()
        } else {
            common.kmer_size.clone()
        },
        min_supporting_reads: common.min_supporting_reads,
        max_variant_size: common.max_variant_size,
    }
}

fn caller_parameters(common: &CommonOptions) -> Result<CallerParameters> {
    CallerParametersBuilder::default()
        .max_haplotypes(common.max_haplotypes)
        .min_phase_score(common.min_phase_score)
        .refcall_type(if common.refcalls {
            RefCallType::Blocked
        } else {
            RefCallType::None
        })
        .call_sites_only(common.sites_only)
        .lagging(true)
        .build()
        .map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_read_sources(reads: &[String]) -> Result<Vec<(SampleName, PathBuf)>> {
    reads
        .iter()
        .map(|spec| {
            let (sample, path) = spec.split_once('=').ok_or_else(|| {
                errors::Error::ConflictingOptions {
                    msg: format!("read files must be given as SAMPLE=PATH, got '{}'", spec),
                }
            })?;
            Ok((sample.to_owned(), PathBuf::from(path)))
        })
        .collect()
}

fn parse_contig_ploidies(
    specs: &[String],
    reference: &Reference,
) -> Result<HashMap<String, usize>> {
    let mut result = HashMap::new();
    for spec in specs {
        let (contig, ploidy) = spec.split_once('=').ok_or_else(|| {
            errors::Error::InvalidContigPloidy { spec: spec.clone() }
        })?;
        let ploidy: usize = ploidy
            .parse()
            .map_err(|_| errors::Error::InvalidContigPloidy { spec: spec.clone() })?;
        if reference.contig(contig).is_err() {
            warn!("contig-ploidies entry {} does not match any contig", contig);
            continue;
        }
        result.insert(contig.to_owned(), ploidy);
    }
    Ok(result)
}

fn parse_region_spec(
    spec: &str,
    reference: &Reference,
    one_based: bool,
) -> Result<GenomicRegion> {
    let invalid = || errors::Error::InvalidRegionSpec {
        spec: spec.to_owned(),
    };
    let (contig, range) = match spec.split_once(':') {
        None => return reference.contig_region(spec),
        Some(parts) => parts,
    };
    let contig_region = reference.contig_region(contig)?;
    let (begin, end) = match range.split_once('-') {
        Some((begin, end)) => (
            begin.parse::<u64>().map_err(|_| invalid())?,
            end.parse::<u64>().map_err(|_| invalid())?,
        ),
        None => {
            let begin = range.parse::<u64>().map_err(|_| invalid())?;
            (begin, begin + 1)
        }
    };
    let (begin, end) = if one_based {
        (begin.saturating_sub(1), end)
    } else {
        (begin, end)
    };
    if begin > end || end > contig_region.end() {
        return Err(invalid().into());
    }
    Ok(GenomicRegion::new(contig.to_owned(), begin, end))
}

fn read_region_file(path: &PathBuf) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| errors::Error::MalformedFile {
        path: path.clone(),
        msg: e.to_string(),
    })?;
    let mut specs = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("unreadable region file line")?;
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            specs.push(trimmed.to_owned());
        }
    }
    Ok(specs)
}

fn resolve_regions(common: &CommonOptions, reference: &Reference) -> Result<Vec<GenomicRegion>> {
    let mut specs = common.regions.clone();
    if let Some(path) = &common.regions_file {
        specs.extend(read_region_file(path)?);
    }
    let mut targets: Vec<GenomicRegion> = if specs.is_empty() {
        let mut contigs = reference.contigs().to_vec();
        common.contig_output_order.sort(&mut contigs);
        contigs
            .iter()
            .map(|contig| GenomicRegion::new(contig.name.clone(), 0, contig.size))
            .collect()
    } else {
        let mut targets = specs
            .iter()
            .map(|spec| parse_region_spec(spec, reference, common.use_one_based_indexing))
            .collect::<Result<Vec<_>>>()?;
        sort_by_contig_order(&mut targets, reference, common.contig_output_order);
        targets
    };
    let mut skip_specs = common.skip_regions.clone();
    if let Some(path) = &common.skip_regions_file {
        skip_specs.extend(read_region_file(path)?);
    }
    if !skip_specs.is_empty() {
        let skips = skip_specs
            .iter()
            .map(|spec| parse_region_spec(spec, reference, common.use_one_based_indexing))
            .collect::<Result<Vec<_>>>()?;
        targets = targets
            .into_iter()
            .flat_map(|target| {
                let mut covered: Vec<GenomicRegion> = skips
                    .iter()
                    .filter(|skip| skip.overlaps(&target))
                    .cloned()
                    .collect();
                covered.sort();
                crate::genome::intervening_regions(&target, &covered)
            })
            .collect();
    }
    Ok(targets)
}

fn sort_by_contig_order(
    regions: &mut [GenomicRegion],
    reference: &Reference,
    order: ContigOrder,
) {
    let mut contigs = reference.contigs().to_vec();
    order.sort(&mut contigs);
    let rank: HashMap<&str, usize> = contigs
        .iter()
        .enumerate()
        .map(|(index, contig)| (contig.name.as_str(), index))
        .collect();
    regions.sort_by(|a, b| {
        rank.get(a.contig())
            .cmp(&rank.get(b.contig()))
            .then_with(|| a.begin().cmp(&b.begin()))
            .then_with(|| a.end().cmp(&b.end()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::tests::mock_reference;

    #[test]
    fn test_parse_region_specs() {
        let reference = mock_reference("chr1", &vec![b'A'; 1000]);
        let whole = parse_region_spec("chr1", &reference, false).unwrap();
        assert_eq!(whole, GenomicRegion::new("chr1", 0, 1000));
        let window = parse_region_spec("chr1:100-200", &reference, false).unwrap();
        assert_eq!(window, GenomicRegion::new("chr1", 100, 200));
        let one_based = parse_region_spec("chr1:100-200", &reference, true).unwrap();
        assert_eq!(one_based, GenomicRegion::new("chr1", 99, 200));
        assert!(parse_region_spec("chr2:1-10", &reference, false).is_err());
        assert!(parse_region_spec("chr1:banana", &reference, false).is_err());
    }

    #[test]
    fn test_parse_read_sources() {
        let sources = parse_read_sources(&["s1=/tmp/a.bam".to_owned()]).unwrap();
        assert_eq!(sources[0].0, "s1");
        assert!(parse_read_sources(&["nope".to_owned()]).is_err());
    }

    #[test]
    fn test_contig_ploidy_parsing_warns_on_unknown() {
        let reference = mock_reference("chr1", b"ACGT");
        let ploidies = parse_contig_ploidies(
            &["chr1=1".to_owned(), "chrZ=4".to_owned()],
            &reference,
        )
        .unwrap();
        assert_eq!(ploidies.get("chr1"), Some(&1));
        assert!(!ploidies.contains_key("chrZ"));
        assert!(parse_contig_ploidies(&["bad".to_owned()], &reference).is_err());
    }
}
