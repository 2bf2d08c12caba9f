//! Trio caller strategy: germline, de-novo, and reference-reversion calls.

use anyhow::Result;
use bio::stats::LogProb;

use crate::calling::{call_genotype, Call, CallType, CallerStrategy, GenotypeCall};
use crate::genome::GenomicRegion;
use crate::likelihood::HaplotypeLikelihoodArray;
use crate::model::priors::{DeNovoModel, GenotypePriorModel};
use crate::model::trio::{is_denovo, JointProbability, TrioPloidies};
use crate::model::{Latents, TrioModel};
use crate::reads::pipe::ReadMap;
use crate::utils::log_prob_false_to_phred;
use crate::variants::{decompose, Allele, Haplotype, Variant};
use crate::SampleName;

#[derive(Debug, Clone)]
pub struct TrioCallerParameters {
    pub ploidies: TrioPloidies,
    pub max_genotype_combinations: usize,
    pub min_variant_posterior: f64,
    pub min_denovo_posterior: f64,
    pub min_refcall_posterior: f64,
    pub denovo_mutation_rate: f64,
}

impl Default for TrioCallerParameters {
    fn default() -> Self {
        TrioCallerParameters {
            ploidies: TrioPloidies {
                maternal: 2,
                paternal: 2,
                child: 2,
            },
            max_genotype_combinations: crate::constants::DEFAULT_MAX_GENOTYPES,
            min_variant_posterior: 2.0,
            min_denovo_posterior: 13.0,
            min_refcall_posterior: 2.0,
            denovo_mutation_rate: crate::constants::DEFAULT_DENOVO_MUTATION_RATE,
        }
    }
}

pub struct TrioCallerStrategy {
    samples: Vec<SampleName>,
    prior: GenotypePriorModel,
    parameters: TrioCallerParameters,
}

impl TrioCallerStrategy {
    pub fn new(
        mother: SampleName,
        father: SampleName,
        child: SampleName,
        prior: GenotypePriorModel,
        parameters: TrioCallerParameters,
    ) -> Result<Self> {
        parameters.ploidies.validate()?;
        Ok(TrioCallerStrategy {
            samples: vec![mother, father, child],
            prior,
            parameters,
        })
    }

    fn mother(&self) -> &SampleName {
        &self.samples[0]
    }

    fn father(&self) -> &SampleName {
        &self.samples[1]
    }

    fn child(&self) -> &SampleName {
        &self.samples[2]
    }

    /// Mass of joint tuples failing the predicate, as a PHRED score of the
    /// complement.
    fn marginalise_condition<P>(joint: &[JointProbability], pred: P) -> f64
    where
        P: Fn(&JointProbability) -> bool,
    {
        let failing: Vec<LogProb> = joint
            .iter()
            .filter(|jp| !pred(jp))
            .map(|jp| jp.log_probability)
            .collect();
        if failing.is_empty() {
            f64::INFINITY
        } else {
            log_prob_false_to_phred(LogProb::ln_sum_exp(&failing))
        }
    }

    /// The maximum-a-posteriori trio, preferring tuples consistent with the
    /// de-novo classification of the called alleles: first viable after a
    /// stable sort by posterior, falling back to the unconstrained MAP.
    fn call_trio<'a>(
        joint: &'a [JointProbability],
        haplotypes: &[Haplotype],
        germline_alleles: &[&Allele],
        denovo_alleles: &[&Allele],
    ) -> &'a JointProbability {
        let viable = |jp: &JointProbability| {
            germline_alleles
                .iter()
                .all(|allele| !is_denovo(allele, &jp.maternal, &jp.paternal, &jp.child, haplotypes))
                && denovo_alleles
                    .iter()
                    .all(|allele| is_denovo(allele, &jp.maternal, &jp.paternal, &jp.child, haplotypes))
        };
        let map = joint
            .iter()
            .max_by(|a, b| a.probability.partial_cmp(&b.probability).unwrap())
            .expect("joint posterior is non-empty");
        if joint.len() == 1 || viable(map) {
            return map;
        }
        let mut sorted: Vec<&JointProbability> = joint.iter().collect();
        sorted.sort_by(|a, b| b.probability.partial_cmp(&a.probability).unwrap());
        sorted
            .into_iter()
            .skip(1)
            .find(|jp| viable(jp))
            .unwrap_or(map)
    }

    fn genotype_calls(
        &self,
        region: &GenomicRegion,
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Vec<(SampleName, GenotypeCall)> {
        self.samples
            .iter()
            .map(|sample| {
                (
                    sample.clone(),
                    call_genotype(region, haplotypes, &latents.genotype_posteriors[sample]),
                )
            })
            .collect()
    }
}

impl CallerStrategy for TrioCallerStrategy {
    fn samples(&self) -> &[SampleName] {
        &self.samples
    }

    fn call_types(&self) -> &'static [CallType] {
        &[
            CallType::GermlineVariant,
            CallType::Denovo,
            CallType::DenovoReferenceReversion,
            CallType::Reference,
        ]
    }

    fn infer_latents(
        &mut self,
        haplotypes: &[Haplotype],
        likelihoods: &mut HaplotypeLikelihoodArray,
        region: &GenomicRegion,
    ) -> Result<Latents> {
        let mut model = TrioModel::new(
            self.prior.clone(),
            DeNovoModel::new(self.parameters.denovo_mutation_rate),
            self.parameters.ploidies,
            self.parameters.max_genotype_combinations,
        );
        let (mother, father, child) =
            (self.mother().clone(), self.father().clone(), self.child().clone());
        model.infer(haplotypes, likelihoods, &mother, &father, &child, region)
    }

    fn call_variants(
        &mut self,
        candidates: &[Variant],
        haplotypes: &[Haplotype],
        latents: &Latents,
    ) -> Result<Vec<Call>> {
        let trio = match &latents.trio {
            Some(trio) => trio,
            None => return Ok(Vec::new()),
        };
        let alleles = decompose(candidates);
        // segregation: probability the allele occurs somewhere in the trio
        let segregation: Vec<(&Allele, f64)> = alleles
            .iter()
            .map(|allele| {
                let posterior = Self::marginalise_condition(&trio.joint, |jp| {
                    [&jp.maternal, &jp.paternal, &jp.child].iter().any(|g| {
                        g.iter().any(|&h| {
                            crate::model::trio::contains_helper(
                                &haplotypes[h as usize],
                                allele,
                            )
                        })
                    })
                });
                (allele, posterior)
            })
            .collect();
        let called: Vec<(&Allele, f64)> = segregation
            .into_iter()
            .filter(|(_, posterior)| *posterior >= self.parameters.min_variant_posterior)
            .collect();
        // de-novo classification of the called alleles
        let mut denovos: Vec<(&Allele, f64, f64)> = Vec::new();
        let mut germline: Vec<(&Allele, f64)> = Vec::new();
        for (allele, allele_posterior) in called {
            let denovo_posterior = Self::marginalise_condition(&trio.joint, |jp| {
                is_denovo(allele, &jp.maternal, &jp.paternal, &jp.child, haplotypes)
            });
            if denovo_posterior >= self.parameters.min_denovo_posterior {
                denovos.push((allele, allele_posterior, denovo_posterior));
            } else {
                germline.push((allele, allele_posterior));
            }
        }
        let germline_alleles: Vec<&Allele> = germline.iter().map(|(a, _)| *a).collect();
        let denovo_alleles: Vec<&Allele> = denovos.iter().map(|(a, _, _)| *a).collect();
        let called_trio =
            Self::call_trio(&trio.joint, haplotypes, &germline_alleles, &denovo_alleles);
        let genotyped = |allele: &Allele| {
            [&called_trio.maternal, &called_trio.paternal, &called_trio.child]
                .iter()
                .any(|g| {
                    g.iter().any(|&h| {
                        crate::model::trio::contains_helper(&haplotypes[h as usize], allele)
                    })
                })
        };
        let mut calls = Vec::new();
        for (allele, posterior) in germline {
            if !genotyped(allele) {
                continue;
            }
            let variant = match crate::calling::find_variant(allele, candidates) {
                Some(variant) => variant,
                // reference alleles carry no germline record
                None => continue,
            };
            calls.push(Call {
                reference: variant.ref_allele().clone(),
                call_type: CallType::GermlineVariant,
                quality: posterior,
                genotype_calls: self.genotype_calls(variant.region(), haplotypes, latents),
                model_posterior: None,
                denovo_posterior: None,
                somatic_posterior: None,
            });
        }
        for (allele, allele_posterior, denovo_posterior) in denovos {
            if !genotyped(allele) {
                continue;
            }
            let site = candidates
                .iter()
                .find(|candidate| candidate.region() == allele.region());
            let reference = match site {
                Some(candidate) => candidate.ref_allele().clone(),
                None => continue,
            };
            // a de-novo allele equal to the site's reference restores the
            // reference on an otherwise variant background
            let call_type = if *allele == reference {
                CallType::DenovoReferenceReversion
            } else {
                CallType::Denovo
            };
            calls.push(Call {
                reference,
                call_type,
                quality: allele_posterior,
                genotype_calls: self.genotype_calls(allele.region(), haplotypes, latents),
                model_posterior: None,
                denovo_posterior: Some(denovo_posterior),
                somatic_posterior: None,
            });
        }
        calls.sort_by(|a, b| a.region().cmp(b.region()));
        Ok(calls)
    }

    fn call_reference(
        &mut self,
        alleles: &[Allele],
        haplotypes: &[Haplotype],
        latents: &Latents,
        _reads: &ReadMap,
    ) -> Result<Vec<Call>> {
        let mut calls = Vec::new();
        for allele in alleles {
            let genotype_calls = self.genotype_calls(allele.region(), haplotypes, latents);
            let all_reference = genotype_calls.iter().all(|(_, call)| {
                call.ploidy() == 0
                    || call
                        .genotype
                        .iter()
                        .all(|called| called.sequence() == allele.sequence())
            });
            let min_posterior = genotype_calls
                .iter()
                .map(|(_, call)| call.posterior)
                .fold(f64::INFINITY, f64::min);
            if !all_reference || min_posterior < self.parameters.min_refcall_posterior {
                continue;
            }
            calls.push(Call {
                reference: allele.clone(),
                call_type: CallType::Reference,
                quality: min_posterior,
                genotype_calls,
                model_posterior: None,
                denovo_posterior: None,
                somatic_posterior: None,
            });
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::HaplotypeLikelihoodArray;
    use crate::reads::pipe::ReadMap;
    use crate::reads::tests::mock_read;
    use crate::reference::tests::mock_reference;

    fn fixture(child_alt: usize) -> (Vec<Haplotype>, HaplotypeLikelihoodArray) {
        let reference = mock_reference("chr2", b"ACGTCCGTACGT");
        let region = GenomicRegion::new("chr2", 0, 12);
        let reference_hap = Haplotype::reference(region.clone(), &reference).unwrap();
        let alt = Haplotype::build(
            region,
            vec![Allele::new(GenomicRegion::new("chr2", 4, 5), b"T".to_vec())],
            &reference,
        )
        .unwrap();
        let haplotypes = vec![reference_hap, alt];
        let mut reads = ReadMap::new();
        let make = |n_ref: usize, n_alt: usize, tag: &str| {
            let mut result = Vec::new();
            for i in 0..n_ref {
                let mut read = mock_read("chr2", 0, b"ACGTCCGTACGT", 30);
                read.name_mut()
                    .extend_from_slice(format!("{}r{}", tag, i).as_bytes());
                result.push(read);
            }
            for i in 0..n_alt {
                let mut read = mock_read("chr2", 0, b"ACGTTCGTACGT", 30);
                read.name_mut()
                    .extend_from_slice(format!("{}a{}", tag, i).as_bytes());
                result.push(read);
            }
            result.sort();
            result
        };
        reads.insert("mother".to_owned(), make(30, 0, "m"));
        reads.insert("father".to_owned(), make(30, 0, "f"));
        reads.insert("child".to_owned(), make(30 - child_alt, child_alt, "c"));
        let mut array = HaplotypeLikelihoodArray::new(vec![
            "mother".to_owned(),
            "father".to_owned(),
            "child".to_owned(),
        ]);
        array.populate(&reads, &haplotypes, None);
        (haplotypes, array)
    }

    fn strategy() -> TrioCallerStrategy {
        use crate::model::priors::CoalescentModel;
        TrioCallerStrategy::new(
            "mother".to_owned(),
            "father".to_owned(),
            "child".to_owned(),
            GenotypePriorModel::Coalescent(CoalescentModel::default()),
            TrioCallerParameters::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_denovo_snv_called() {
        let (haplotypes, mut array) = fixture(15);
        let mut strategy = strategy();
        let region = GenomicRegion::new("chr2", 0, 12);
        let latents = strategy
            .infer_latents(&haplotypes, &mut array, &region)
            .unwrap();
        let candidate = Variant::from_sequences("chr2", 4, b"C".to_vec(), b"T".to_vec());
        let calls = strategy
            .call_variants(&[candidate], &haplotypes, &latents)
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_type, CallType::Denovo);
        let denovo_posterior = calls[0].denovo_posterior.unwrap();
        assert!(denovo_posterior >= 20.0);
        // the child is genotyped het, the parents hom-ref
        let child_call = calls[0].genotype_call(&"child".to_owned()).unwrap();
        assert!(child_call
            .genotype
            .iter()
            .any(|allele| allele.sequence() == b"T"));
        let mother_call = calls[0].genotype_call(&"mother".to_owned()).unwrap();
        assert!(mother_call
            .genotype
            .iter()
            .all(|allele| allele.sequence() == b"C"));
    }

    #[test]
    fn test_no_call_when_trio_is_reference() {
        let (haplotypes, mut array) = fixture(0);
        let mut strategy = strategy();
        let region = GenomicRegion::new("chr2", 0, 12);
        let latents = strategy
            .infer_latents(&haplotypes, &mut array, &region)
            .unwrap();
        let candidate = Variant::from_sequences("chr2", 4, b"C".to_vec(), b"T".to_vec());
        let calls = strategy
            .call_variants(&[candidate], &haplotypes, &latents)
            .unwrap();
        assert!(calls.is_empty());
    }
}
