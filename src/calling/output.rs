//! VCF/BCF emission of finished records.

use std::path::Path;

use anyhow::{Context, Result};
use rust_htslib::bcf::record::GenotypeAllele;
use rust_htslib::bcf::{self, Format};

use crate::calling::record_factory::VcfRecord;
use crate::genome::{Contig, ContigOrder};
use crate::SampleName;

pub struct VcfWriter {
    writer: bcf::Writer,
    sites_only: bool,
}

impl VcfWriter {
    pub fn new(
        path: Option<&Path>,
        contigs: &[Contig],
        contig_order: ContigOrder,
        samples: &[SampleName],
        sites_only: bool,
    ) -> Result<Self> {
        let mut header = bcf::Header::new();
        let mut ordered = contigs.to_vec();
        contig_order.sort(&mut ordered);
        for contig in &ordered {
            header.push_record(
                format!("##contig=<ID={},length={}>", contig.name, contig.size).as_bytes(),
            );
        }
        header.push_record(
            b"##INFO=<ID=NS,Number=1,Type=Integer,Description=\"Number of samples with data\">",
        );
        header.push_record(
            b"##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Combined read depth\">",
        );
        header.push_record(
            b"##INFO=<ID=SB,Number=1,Type=Float,Description=\"Strand bias (forward read fraction)\">",
        );
        header.push_record(
            b"##INFO=<ID=BQ,Number=1,Type=Integer,Description=\"RMS base quality\">",
        );
        header.push_record(
            b"##INFO=<ID=MQ,Number=1,Type=Integer,Description=\"RMS mapping quality\">",
        );
        header.push_record(
            b"##INFO=<ID=MQ0,Number=1,Type=Integer,Description=\"Number of reads with mapping quality zero\">",
        );
        header.push_record(
            b"##INFO=<ID=MP,Number=1,Type=Float,Description=\"Model posterior\">",
        );
        header.push_record(
            b"##INFO=<ID=DENOVO,Number=1,Type=Float,Description=\"PHRED-scaled posterior probability the variant is de novo in the child\">",
        );
        header.push_record(
            b"##INFO=<ID=SOMATIC,Number=1,Type=Float,Description=\"PHRED-scaled posterior probability the variant is somatic\">",
        );
        if !sites_only {
            header.push_record(b"##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">");
            header.push_record(
                b"##FORMAT=<ID=GQ,Number=1,Type=Integer,Description=\"Genotype quality\">",
            );
            header.push_record(
                b"##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Read depth\">",
            );
            header.push_record(
                b"##FORMAT=<ID=BQ,Number=1,Type=Integer,Description=\"RMS base quality\">",
            );
            header.push_record(
                b"##FORMAT=<ID=MQ,Number=1,Type=Integer,Description=\"RMS mapping quality\">",
            );
            header.push_record(
                b"##FORMAT=<ID=PS,Number=1,Type=Integer,Description=\"Phase set\">",
            );
            header.push_record(
                b"##FORMAT=<ID=PQ,Number=1,Type=Integer,Description=\"PHRED-scaled phase quality\">",
            );
            for sample in samples {
                header.push_sample(sample.as_bytes());
            }
        }
        let writer = match path {
            Some(path) => bcf::Writer::from_path(path, &header, true, Format::Vcf)
                .context(format!("unable to write VCF to {}", path.display()))?,
            None => bcf::Writer::from_stdout(&header, true, Format::Vcf)?,
        };
        Ok(VcfWriter { writer, sites_only })
    }

    pub fn write(&mut self, record: &VcfRecord) -> Result<()> {
        let mut out = self.writer.empty_record();
        let rid = self.writer.header().name2rid(record.chrom.as_bytes())?;
        out.set_rid(Some(rid));
        out.set_pos(record.pos as i64);
        let mut alleles: Vec<&[u8]> = vec![&record.ref_allele];
        alleles.extend(record.alt_alleles.iter().map(|alt| alt.as_slice()));
        out.set_alleles(&alleles)?;
        out.set_qual(record.qual as f32);
        out.push_info_integer(b"NS", &[record.num_samples_with_coverage as i32])?;
        out.push_info_integer(b"DP", &[record.depth as i32])?;
        out.push_info_float(b"SB", &[record.strand_bias as f32])?;
        out.push_info_integer(b"BQ", &[record.base_quality as i32])?;
        out.push_info_integer(b"MQ", &[record.mapping_quality as i32])?;
        out.push_info_integer(b"MQ0", &[record.mapq_zero as i32])?;
        if let Some(mp) = record.model_posterior {
            out.push_info_float(b"MP", &[mp as f32])?;
        }
        if let Some(denovo) = record.denovo {
            out.push_info_float(b"DENOVO", &[denovo as f32])?;
        }
        if let Some(somatic) = record.somatic {
            out.push_info_float(b"SOMATIC", &[somatic as f32])?;
        }
        if !self.sites_only && !record.samples.is_empty() {
            let ploidy = record
                .samples
                .iter()
                .map(|fields| fields.genotype.len())
                .max()
                .unwrap_or(0);
            let mut genotypes: Vec<GenotypeAllele> = Vec::new();
            for fields in &record.samples {
                for (index, sequence) in fields.genotype.iter().enumerate() {
                    let allele = if sequence == b"." {
                        if fields.phased && index > 0 {
                            GenotypeAllele::PhasedMissing
                        } else {
                            GenotypeAllele::UnphasedMissing
                        }
                    } else {
                        let allele_index = allele_index(sequence, &alleles)?;
                        if fields.phased && index > 0 {
                            GenotypeAllele::Phased(allele_index)
                        } else {
                            GenotypeAllele::Unphased(allele_index)
                        }
                    };
                    genotypes.push(allele);
                }
                for _ in fields.genotype.len()..ploidy {
                    genotypes.push(GenotypeAllele::UnphasedMissing);
                }
            }
            out.push_genotypes(&genotypes)?;
            let gq: Vec<i32> = record
                .samples
                .iter()
                .map(|fields| fields.genotype_quality)
                .collect();
            out.push_format_integer(b"GQ", &gq)?;
            let dp: Vec<i32> = record
                .samples
                .iter()
                .map(|fields| fields.depth as i32)
                .collect();
            out.push_format_integer(b"DP", &dp)?;
            let bq: Vec<i32> = record
                .samples
                .iter()
                .map(|fields| fields.base_quality as i32)
                .collect();
            out.push_format_integer(b"BQ", &bq)?;
            let mq: Vec<i32> = record
                .samples
                .iter()
                .map(|fields| fields.mapping_quality as i32)
                .collect();
            out.push_format_integer(b"MQ", &mq)?;
            if record.samples.iter().all(|fields| fields.phased) {
                let ps: Vec<i32> = record
                    .samples
                    .iter()
                    .map(|fields| fields.phase_set.map_or(0, |ps| ps as i32 + 1))
                    .collect();
                out.push_format_integer(b"PS", &ps)?;
                let pq: Vec<i32> = record
                    .samples
                    .iter()
                    .map(|fields| fields.phase_quality.unwrap_or(0))
                    .collect();
                out.push_format_integer(b"PQ", &pq)?;
            }
        }
        self.writer.write(&out)?;
        Ok(())
    }
}

fn allele_index(sequence: &[u8], alleles: &[&[u8]]) -> Result<i32> {
    alleles
        .iter()
        .position(|allele| *allele == sequence)
        .map(|index| index as i32)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "genotype allele {} not present in record alleles",
                String::from_utf8_lossy(sequence)
            )
        })
}
