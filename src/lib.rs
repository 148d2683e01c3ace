// ==============================================================================
// lib.rs - Variant Pipeline Library
// ==============================================================================
// Description: Concurrent variant import, export and group association
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

pub mod aggregator;
pub mod associate;
pub mod barrier;
pub mod binning;
pub mod error;
pub mod exporter;
pub mod format;
pub mod group_worker;
pub mod grouping;
pub mod importer;
pub mod index;
pub mod loader;
pub mod logging;
pub mod maintenance;
pub mod methods;
pub mod models;
pub mod parser;
pub mod phenotype;
pub mod project;
pub mod reader_pool;
pub mod settings;
pub mod shelf;
pub mod store;
pub mod writer;

pub use associate::{associate, AssociationOptions};
pub use error::{ConfigError, GroupError, PipelineError, PipelineResult, RecordError};
pub use exporter::{export, ExportOptions};
pub use importer::{import, ImportOptions};
pub use phenotype::{load_phenotypes, PhenotypeOptions};
pub use project::Project;
