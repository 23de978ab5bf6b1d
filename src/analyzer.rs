//! One-call integrity analysis: convert, find missing objects, then trace
//! who references them.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;
use tracing::Span;

use crate::config::AnalysisConfig;
use crate::convert::{ConversionOutput, ShardConverter};
use crate::error::Result;
use crate::missing::{MissingObjectSearch, MissingObjects};
use crate::pipeline::CancelToken;
use crate::reverse::{ParentChains, ReverseSearch};
use crate::shard::{ObjectId, ShardCatalog};

/// Everything one analysis run found.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub conversion: ConversionOutput,
    pub missing: MissingObjects,
    /// Parents of every missing id, and of their parents, toward the roots.
    pub parents: ParentChains,
}

impl IntegrityReport {
    /// No referenced id is missing.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
    }

    /// For each missing id, the path from it toward a root.
    pub fn dangling_chains(&self) -> Vec<Vec<ObjectId>> {
        self.missing
            .ids()
            .iter()
            .map(|&id| self.parents.chain_to_root(id))
            .collect()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs the analysis stages with one configuration, span and cancel token.
pub struct IntegrityAnalyzer {
    config: AnalysisConfig,
    span: Span,
    cancel: CancelToken,
}

impl IntegrityAnalyzer {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            span: Span::none(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn convert(&self, catalog: &ShardCatalog) -> Result<ConversionOutput> {
        ShardConverter::new(&self.config)
            .with_span(self.span.clone())
            .with_cancel(self.cancel.clone())
            .convert(catalog)
    }

    pub fn find_missing(
        &self,
        catalog: &ShardCatalog,
        reference_set_paths: &[PathBuf],
    ) -> Result<MissingObjects> {
        MissingObjectSearch::new(&self.config)
            .with_span(self.span.clone())
            .with_cancel(self.cancel.clone())
            .find_missing(catalog, reference_set_paths)
    }

    pub fn reverse_search(
        &self,
        reverse_map_paths: &[PathBuf],
        targets: &BTreeSet<ObjectId>,
    ) -> Result<ParentChains> {
        ReverseSearch::new(&self.config)
            .with_span(self.span.clone())
            .with_cancel(self.cancel.clone())
            .reverse_search(reverse_map_paths, targets.iter().copied())
    }

    /// Convert every shard, find the missing ids, and trace their parents.
    pub fn run(&self, catalog: &ShardCatalog) -> Result<IntegrityReport> {
        let span = tracing::info_span!(parent: &self.span, "analysis", shards = catalog.len());
        let _entered = span.enter();

        let conversion = self.convert(catalog)?;
        let missing = self.find_missing(catalog, &conversion.reference_set_paths)?;
        let parents = self.reverse_search(&conversion.reverse_map_paths, missing.ids())?;

        tracing::info!(
            missing = missing.len(),
            traced = parents.len(),
            "analysis finished"
        );
        Ok(IntegrityReport {
            conversion,
            missing,
            parents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::shard::codec::{write_adjacency_map, DEFAULT_WRITE_BUFFER};
    use crate::shard::AdjacencyMap;
    use tempfile::tempdir;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AnalysisConfig::default();
        config.id_range.min = 10;
        config.id_range.max = 1;
        assert!(matches!(
            IntegrityAnalyzer::new(config),
            Err(AnalysisError::Config(_))
        ));
    }

    #[test]
    fn test_run_reports_dangling_chain() {
        let dir = tempdir().unwrap();
        let a: AdjacencyMap = [(1, vec![5]), (5, vec![150])].into_iter().collect();
        let b: AdjacencyMap = [(150, vec![2, 7]), (7, vec![])].into_iter().collect();
        let pa = dir.path().join("a.fwd");
        let pb = dir.path().join("b.fwd");
        write_adjacency_map(&pa, &a, DEFAULT_WRITE_BUFFER).unwrap();
        write_adjacency_map(&pb, &b, DEFAULT_WRITE_BUFFER).unwrap();
        let catalog = ShardCatalog::new().with_shard(0, 0, pa).with_shard(1, 0, pb);

        let report = IntegrityAnalyzer::new(AnalysisConfig::default())
            .unwrap()
            .run(&catalog)
            .unwrap();

        assert!(!report.is_consistent());
        assert_eq!(report.missing.ids(), &BTreeSet::from([2]));
        assert_eq!(report.dangling_chains(), vec![vec![2, 150, 5, 1]]);
        assert!(report.to_json_string().unwrap().contains("\"missing\""));
    }
}
