// ==============================================================================
// methods.rs - Association Methods
// ==============================================================================
// Description: Per-group computations and their command-line style specs
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// A method is given as one string, e.g. "BurdenPermute --permutations 500
// --name perm". Specs are parsed once before the run; every group worker
// builds its own method instances from them.
// ==============================================================================

use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::error::{ConfigError, GroupError};
use crate::models::{GroupKey, GroupValue};
use crate::store::check_identifier;

/// Filtered genotype matrix and phenotype of one group
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationData {
    /// samples x loci genotype codes, NaN when missing
    pub genotypes: Vec<Vec<f64>>,
    pub phenotype: Vec<f64>,
}

impl AssociationData {
    pub fn sample_count(&self) -> usize {
        self.genotypes.len()
    }

    pub fn variant_count(&self) -> usize {
        self.genotypes.first().map(Vec::len).unwrap_or(0)
    }

    /// Sum of called genotype codes per sample
    pub fn burden(&self) -> Vec<f64> {
        self.genotypes
            .iter()
            .map(|row| row.iter().filter(|v| !v.is_nan()).sum())
            .collect()
    }
}

/// Point in time after which a group computation gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn check(&self) -> Result<(), GroupError> {
        if Instant::now() >= self.at {
            Err(GroupError::Timeout(self.limit))
        } else {
            Ok(())
        }
    }
}

pub trait AssociationTest: Send {
    /// Result field names, in the order `compute` returns values
    fn fields(&self) -> Vec<String>;

    /// Called before `compute` for each group
    fn start_group(&mut self, _group: &GroupKey) {}

    fn compute(&mut self, data: &AssociationData, deadline: Option<&Deadline>) -> Result<Vec<f64>, GroupError>;
}

/// Stable 64-bit digest of a group key, the same in every process
pub fn group_digest(group: &GroupKey) -> u64 {
    let mut hasher = Sha256::new();
    for value in group.values() {
        match value {
            GroupValue::Null => hasher.update([0u8]),
            GroupValue::Int(v) => {
                hasher.update([1u8]);
                hasher.update(v.to_le_bytes());
            }
            GroupValue::Real(v) => {
                hasher.update([2u8]);
                hasher.update(v.to_le_bytes());
            }
            GroupValue::Text(s) => {
                hasher.update([3u8]);
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

fn field_names(prefix: &str, names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("{}_{}", prefix, n)).collect()
}

#[derive(Debug, Clone, Parser)]
#[command(name = "BurdenCorr", about = "Correlation between variant burden and a quantitative phenotype")]
pub struct BurdenCorrArgs {
    /// Prefix of the result fields
    #[arg(long, default_value = "BurdenCorr")]
    pub name: String,
}

pub struct BurdenCorr {
    args: BurdenCorrArgs,
}

impl AssociationTest for BurdenCorr {
    fn fields(&self) -> Vec<String> {
        field_names(&self.args.name, &["corr", "t"])
    }

    fn compute(&mut self, data: &AssociationData, _deadline: Option<&Deadline>) -> Result<Vec<f64>, GroupError> {
        let r = pearson(&data.burden(), &data.phenotype)
            .ok_or_else(|| GroupError::Degenerate("burden or phenotype has no variance".into()))?;
        let n = data.sample_count() as f64;
        let t = if r.abs() >= 1.0 {
            f64::INFINITY.copysign(r)
        } else {
            r * ((n - 2.0) / (1.0 - r * r)).sqrt()
        };
        Ok(vec![r, t])
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "CaseCtrlCounts", about = "Carrier counts among cases and controls")]
pub struct CaseCtrlCountsArgs {
    #[arg(long, default_value = "CaseCtrlCounts")]
    pub name: String,
}

pub struct CaseCtrlCounts {
    args: CaseCtrlCountsArgs,
}

impl AssociationTest for CaseCtrlCounts {
    fn fields(&self) -> Vec<String> {
        field_names(&self.args.name, &["case_carriers", "ctrl_carriers", "cases", "ctrls"])
    }

    fn compute(&mut self, data: &AssociationData, _deadline: Option<&Deadline>) -> Result<Vec<f64>, GroupError> {
        if data.phenotype.iter().any(|p| *p != 0.0 && *p != 1.0) {
            return Err(GroupError::NonBinaryPhenotype);
        }
        let mut counts = [0.0; 4];
        for (burden, pheno) in data.burden().iter().zip(&data.phenotype) {
            let case = *pheno == 1.0;
            if *burden > 0.0 {
                counts[if case { 0 } else { 1 }] += 1.0;
            }
            counts[if case { 2 } else { 3 }] += 1.0;
        }
        Ok(counts.to_vec())
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "BurdenPermute", about = "Permutation p-value of the burden/phenotype correlation")]
pub struct BurdenPermuteArgs {
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub permutations: u64,

    /// Seed of the permutation generator, random when absent
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value = "BurdenPermute")]
    pub name: String,
}

pub struct BurdenPermute {
    args: BurdenPermuteArgs,
    rng: StdRng,
}

impl AssociationTest for BurdenPermute {
    fn fields(&self) -> Vec<String> {
        field_names(&self.args.name, &["stat", "pvalue"])
    }

    /// With `--seed`, every group restarts from a generator derived from its key
    fn start_group(&mut self, group: &GroupKey) {
        if let Some(seed) = self.args.seed {
            self.rng = StdRng::seed_from_u64(seed ^ group_digest(group));
        }
    }

    fn compute(&mut self, data: &AssociationData, deadline: Option<&Deadline>) -> Result<Vec<f64>, GroupError> {
        let burden = data.burden();
        let observed = pearson(&burden, &data.phenotype)
            .ok_or_else(|| GroupError::Degenerate("burden or phenotype has no variance".into()))?
            .abs();
        let mut shuffled = data.phenotype.clone();
        let mut exceed = 0u64;
        for _ in 0..self.args.permutations {
            if let Some(deadline) = deadline {
                deadline.check()?;
            }
            shuffled.shuffle(&mut self.rng);
            if pearson(&burden, &shuffled).map(f64::abs).unwrap_or(0.0) >= observed {
                exceed += 1;
            }
        }
        let pvalue = (exceed + 1) as f64 / (self.args.permutations + 1) as f64;
        Ok(vec![observed, pvalue])
    }
}

/// A parsed method specification
#[derive(Debug, Clone)]
pub enum MethodSpec {
    BurdenCorr(BurdenCorrArgs),
    CaseCtrlCounts(CaseCtrlCountsArgs),
    BurdenPermute(BurdenPermuteArgs),
}

fn parse_args<T: Parser>(method: &str, tokens: &[&str]) -> Result<T, ConfigError> {
    T::try_parse_from(tokens.iter().copied()).map_err(|e| ConfigError::MethodArguments {
        method: method.to_string(),
        reason: e.to_string().trim().to_string(),
    })
}

impl MethodSpec {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let Some(method) = tokens.first().copied() else {
            return Err(ConfigError::UnknownMethod(String::new()));
        };
        let parsed = match method {
            "BurdenCorr" => MethodSpec::BurdenCorr(parse_args(method, &tokens)?),
            "CaseCtrlCounts" => MethodSpec::CaseCtrlCounts(parse_args(method, &tokens)?),
            "BurdenPermute" => MethodSpec::BurdenPermute(parse_args(method, &tokens)?),
            other => return Err(ConfigError::UnknownMethod(other.to_string())),
        };
        check_identifier(parsed.name())?;
        Ok(parsed)
    }

    pub fn name(&self) -> &str {
        match self {
            MethodSpec::BurdenCorr(a) => &a.name,
            MethodSpec::CaseCtrlCounts(a) => &a.name,
            MethodSpec::BurdenPermute(a) => &a.name,
        }
    }

    pub fn build(&self) -> Box<dyn AssociationTest> {
        match self {
            MethodSpec::BurdenCorr(args) => Box::new(BurdenCorr { args: args.clone() }),
            MethodSpec::CaseCtrlCounts(args) => Box::new(CaseCtrlCounts { args: args.clone() }),
            MethodSpec::BurdenPermute(args) => Box::new(BurdenPermute {
                rng: match args.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                },
                args: args.clone(),
            }),
        }
    }

    pub fn fields(&self) -> Vec<String> {
        self.build().fields()
    }
}

/// Parse all method specs and reject duplicate result fields
pub fn parse_methods(specs: &[String]) -> Result<Vec<MethodSpec>, ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::Setting("no association method given".into()));
    }
    let methods = specs
        .iter()
        .map(|s| MethodSpec::parse(s))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    for method in &methods {
        for field in method.fields() {
            if !seen.insert(field.clone()) {
                return Err(ConfigError::MethodArguments {
                    method: method.name().to_string(),
                    reason: format!("duplicate result field {}; use --name to rename", field),
                });
            }
        }
    }
    Ok(methods)
}

/// Result fields of all methods, in output order
pub fn result_fields(methods: &[MethodSpec]) -> Vec<String> {
    methods.iter().flat_map(|m| m.fields()).collect()
}
