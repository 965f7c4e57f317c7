//! Reconciliation run orchestration.
//!
//! A run derives the remediation mapping from the source literal array,
//! persists it as the mapping artifact, and propagates it independently to
//! the remote store and the two local documents. The artifact is the sole
//! input of both propagation steps, so they can be re-attempted later
//! without re-deriving (and re-shuffling) the assignments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use csr_core::{CandidatePool, MappingEntry, PatchOutcome, UnassignedDuplicate};
use csr_extract::{allocate, extract_records, find_duplicates, DEFAULT_ARRAY_MARKER};
use csr_patch::{DocumentPatcher, DocumentSyntax};
use csr_remote::{RemoteBatchSummary, RemoteConfig, RemotePatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csr-pipeline";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source_array: PathBuf,
    pub seed_sql: PathBuf,
    pub pool_file: PathBuf,
    pub mapping_file: PathBuf,
    pub reports_dir: PathBuf,
    pub array_marker: String,
    pub shuffle_seed: u64,
    pub http_timeout_secs: u64,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self {
            source_array: std::env::var("CSR_SOURCE_ARRAY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("services/database.ts")),
            seed_sql: std::env::var("CSR_SEED_SQL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("supabase/seed_companions.sql")),
            pool_file: std::env::var("CSR_POOL_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("pool.yaml")),
            mapping_file: std::env::var("CSR_MAPPING_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("mapping.json")),
            reports_dir: std::env::var("CSR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            array_marker: std::env::var("CSR_ARRAY_MARKER")
                .unwrap_or_else(|_| DEFAULT_ARRAY_MARKER.to_string()),
            shuffle_seed: std::env::var("CSR_SHUFFLE_SEED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(42),
            http_timeout_secs: std::env::var("CSR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Remote endpoint and key have no baked-in default: both must be present
/// in the environment before `apply-remote` can run.
pub fn remote_config_from_env(timeout_secs: u64) -> Result<RemoteConfig> {
    let base_url = std::env::var("CSR_REMOTE_URL").context("CSR_REMOTE_URL is not set")?;
    let api_key = std::env::var("CSR_REMOTE_KEY").context("CSR_REMOTE_KEY is not set")?;
    Ok(RemoteConfig {
        base_url,
        api_key,
        timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct PoolFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    specialties: Vec<String>,
}

pub async fn load_pool(path: &Path) -> Result<CandidatePool> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading candidate pool {}", path.display()))?;
    let file: PoolFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing candidate pool {}", path.display()))?;
    Ok(CandidatePool::new(file.specialties))
}

/// Writes the mapping artifact: a pretty-printed JSON array of
/// `{id, name, old_specialty, new_specialty}` objects.
pub async fn write_mapping_artifact(path: &Path, mapping: &[MappingEntry]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(mapping).context("serializing mapping artifact")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing mapping artifact {}", path.display()))
}

pub async fn load_mapping_artifact(path: &Path) -> Result<Vec<MappingEntry>> {
    let text = fs::read_to_string(path).await.with_context(|| {
        format!(
            "reading mapping artifact {} (run `derive` first)",
            path.display()
        )
    })?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing mapping artifact {}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct DeriveStats {
    pub total_records: usize,
    pub unique_specialties: usize,
    pub duplicates: usize,
}

/// One scoped patch attempt against one document, as recorded in the report.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentPatchRecord {
    pub document: String,
    pub syntax: DocumentSyntax,
    pub id: String,
    pub old_specialty: String,
    pub new_specialty: String,
    #[serde(flatten)]
    pub outcome: PatchOutcome,
}

/// Full machine-readable record of one run. Every failure appears here with
/// enough identifying information to remediate by hand.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub derive: Option<DeriveStats>,
    pub mapping: Vec<MappingEntry>,
    pub unassigned: Vec<UnassignedDuplicate>,
    pub remote: Option<RemoteBatchSummary>,
    /// Set when remote propagation could not start at all (missing
    /// configuration, client build failure). Local patching still runs.
    pub remote_error: Option<String>,
    pub local: Vec<DocumentPatchRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentManifest {
    pub schema_version: u32,
    pub files: Vec<DocumentManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Printable one-line outcome for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub mapping_entries: usize,
    pub unassigned: usize,
    pub remote_succeeded: usize,
    pub remote_attempted: usize,
    pub local_applied: usize,
    pub local_flagged: usize,
    pub reports_dir: String,
}

pub struct ReconcilePipeline {
    config: RunConfig,
}

impl ReconcilePipeline {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Extract -> resolve -> allocate -> persist the mapping artifact.
    /// Extraction failure is fatal; an allocation shortfall is not.
    pub async fn derive(&self) -> Result<(DeriveStats, Vec<MappingEntry>, Vec<UnassignedDuplicate>)> {
        let source_path = &self.config.source_array;
        let source = fs::read_to_string(source_path)
            .await
            .with_context(|| format!("reading source array {}", source_path.display()))?;
        let records = extract_records(&source, &self.config.array_marker)
            .with_context(|| format!("extracting records from {}", source_path.display()))?;
        let duplicates = find_duplicates(&records);
        let pool = load_pool(&self.config.pool_file).await?;

        if duplicates.len() > pool.len() {
            warn!(
                duplicates = duplicates.len(),
                pool = pool.len(),
                "candidate pool smaller than duplicate count; allocation will fall short"
            );
        }

        let allocation = allocate(&duplicates, &pool, self.config.shuffle_seed);
        write_mapping_artifact(&self.config.mapping_file, &allocation.mapping).await?;
        info!(
            entries = allocation.mapping.len(),
            artifact = %self.config.mapping_file.display(),
            "mapping artifact written"
        );

        let stats = DeriveStats {
            total_records: records.len(),
            unique_specialties: records.len() - duplicates.len(),
            duplicates: duplicates.len(),
        };
        Ok((stats, allocation.mapping, allocation.unassigned))
    }

    /// Patches the seed file and the source array from the same mapping.
    /// Each document is mutated in memory and flushed once after all
    /// entries for it have been processed.
    pub async fn patch_local(&self, mapping: &[MappingEntry]) -> Result<Vec<DocumentPatchRecord>> {
        let documents = [
            (self.config.seed_sql.clone(), DocumentSyntax::SeedSql),
            (self.config.source_array.clone(), DocumentSyntax::SourceArray),
        ];

        let mut records = Vec::new();
        for (path, syntax) in documents {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading document {}", path.display()))?;
            let mut patcher = DocumentPatcher::new(syntax, text);

            for entry in mapping {
                let outcome = patcher.apply(entry);
                if outcome.needs_attention() {
                    warn!(
                        document = %path.display(),
                        id = %entry.id,
                        old = %entry.old_specialty,
                        new = %entry.new_specialty,
                        ?outcome,
                        "scoped patch did not apply cleanly"
                    );
                }
                records.push(DocumentPatchRecord {
                    document: path.display().to_string(),
                    syntax,
                    id: entry.id.clone(),
                    old_specialty: entry.old_specialty.clone(),
                    new_specialty: entry.new_specialty.clone(),
                    outcome,
                });
            }

            fs::write(&path, patcher.into_text())
                .await
                .with_context(|| format!("rewriting document {}", path.display()))?;
        }
        Ok(records)
    }

    pub async fn apply_remote(&self, mapping: &[MappingEntry]) -> Result<RemoteBatchSummary> {
        let remote = remote_config_from_env(self.config.http_timeout_secs)?;
        let patcher = RemotePatcher::new(remote)?;
        Ok(patcher.apply_all(mapping).await)
    }

    /// Writes `remediation_report.json`, `remediation_brief.md`, and a
    /// sha256 manifest of the artifacts this run touched.
    pub async fn write_reports(&self, report: &RunReport) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(run_dir.join("remediation_report.json"), json)
            .await
            .context("writing remediation_report.json")?;

        fs::write(run_dir.join("remediation_brief.md"), render_brief(report))
            .await
            .context("writing remediation_brief.md")?;

        let mut files = Vec::new();
        let mut candidates = vec![("mapping_artifact", self.config.mapping_file.clone())];
        if !report.local.is_empty() {
            candidates.push(("seed_sql", self.config.seed_sql.clone()));
            candidates.push(("source_array", self.config.source_array.clone()));
        }
        for (name, path) in candidates {
            if path.exists() {
                files.push(manifest_entry(name, &path)?);
            }
        }
        let manifest = DocumentManifest {
            schema_version: 1,
            files,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing document manifest")?;
        fs::write(run_dir.join("documents.json"), bytes)
            .await
            .context("writing documents.json")?;

        Ok(run_dir)
    }
}

fn manifest_entry(name: &str, path: &Path) -> Result<DocumentManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(DocumentManifestFile {
        name: name.to_string(),
        path: path.display().to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

fn render_brief(report: &RunReport) -> String {
    let mut lines = vec![
        "# Specialty Remediation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Command: {}", report.command),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
    ];
    if let Some(derive) = &report.derive {
        lines.push(format!("- Records extracted: {}", derive.total_records));
        lines.push(format!("- Unique specialties: {}", derive.unique_specialties));
        lines.push(format!("- Duplicates found: {}", derive.duplicates));
    }
    lines.push(format!("- Mapping entries: {}", report.mapping.len()));
    lines.push(format!("- Unassigned duplicates: {}", report.unassigned.len()));
    if let Some(remote) = &report.remote {
        lines.push(format!(
            "- Remote updates: {}/{} succeeded",
            remote.succeeded, remote.attempted
        ));
    }
    if let Some(error) = &report.remote_error {
        lines.push(format!("- Remote propagation did not run: {error}"));
    }

    if !report.mapping.is_empty() {
        lines.push(String::new());
        lines.push("## Mapping".to_string());
        for entry in &report.mapping {
            lines.push(format!(
                "- {} ({}): {} -> {}",
                entry.name, entry.id, entry.old_specialty, entry.new_specialty
            ));
        }
    }

    if !report.unassigned.is_empty() {
        lines.push(String::new());
        lines.push("## Unassigned duplicates (pool exhausted)".to_string());
        for u in &report.unassigned {
            lines.push(format!("- {} ({}): {}", u.name, u.id, u.specialty));
        }
    }

    if let Some(remote) = &report.remote {
        if !remote.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Remote failures".to_string());
            for failure in &remote.failures {
                lines.push(format!("- {}: {}", failure.id, failure.error));
            }
        }
    }

    let flagged: Vec<_> = report
        .local
        .iter()
        .filter(|r| r.outcome.needs_attention())
        .collect();
    if !flagged.is_empty() {
        lines.push(String::new());
        lines.push("## Local patches needing attention".to_string());
        for record in flagged {
            lines.push(format!(
                "- {} in {}: {:?} ({} -> {})",
                record.id, record.document, record.outcome, record.old_specialty, record.new_specialty
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

fn summarize(report: &RunReport, reports_dir: &Path) -> RunSummary {
    RunSummary {
        run_id: report.run_id,
        command: report.command.clone(),
        mapping_entries: report.mapping.len(),
        unassigned: report.unassigned.len(),
        remote_succeeded: report.remote.as_ref().map(|r| r.succeeded).unwrap_or(0),
        remote_attempted: report.remote.as_ref().map(|r| r.attempted).unwrap_or(0),
        local_applied: report
            .local
            .iter()
            .map(|r| r.outcome.substitutions())
            .sum(),
        local_flagged: report
            .local
            .iter()
            .filter(|r| r.outcome.needs_attention())
            .count(),
        reports_dir: reports_dir.display().to_string(),
    }
}

/// Derive the mapping and persist it. Errors if extraction fails or if
/// duplicates existed but no mapping entry could be produced.
pub async fn run_derive(config: RunConfig) -> Result<RunSummary> {
    let pipeline = ReconcilePipeline::new(config);
    let started_at = Utc::now();
    let (stats, mapping, unassigned) = pipeline.derive().await?;
    let duplicates = stats.duplicates;

    let report = RunReport {
        run_id: Uuid::new_v4(),
        command: "derive".to_string(),
        started_at,
        finished_at: Utc::now(),
        derive: Some(stats),
        mapping,
        unassigned,
        remote: None,
        remote_error: None,
        local: Vec::new(),
    };
    let run_dir = pipeline.write_reports(&report).await?;

    if duplicates > 0 && report.mapping.is_empty() {
        bail!(
            "found {duplicates} duplicates but produced no mapping entries; \
             is the candidate pool empty?"
        );
    }
    Ok(summarize(&report, &run_dir))
}

/// Re-runnable remote propagation against the persisted mapping artifact.
pub async fn run_apply_remote(config: RunConfig) -> Result<RunSummary> {
    let pipeline = ReconcilePipeline::new(config);
    let started_at = Utc::now();
    let mapping = load_mapping_artifact(&pipeline.config().mapping_file).await?;
    let remote = pipeline.apply_remote(&mapping).await?;

    let report = RunReport {
        run_id: Uuid::new_v4(),
        command: "apply-remote".to_string(),
        started_at,
        finished_at: Utc::now(),
        derive: None,
        mapping,
        unassigned: Vec::new(),
        remote: Some(remote),
        remote_error: None,
        local: Vec::new(),
    };
    let run_dir = pipeline.write_reports(&report).await?;
    Ok(summarize(&report, &run_dir))
}

/// Re-runnable local propagation against the persisted mapping artifact.
pub async fn run_patch_local(config: RunConfig) -> Result<RunSummary> {
    let pipeline = ReconcilePipeline::new(config);
    let started_at = Utc::now();
    let mapping = load_mapping_artifact(&pipeline.config().mapping_file).await?;
    let local = pipeline.patch_local(&mapping).await?;

    let report = RunReport {
        run_id: Uuid::new_v4(),
        command: "patch-local".to_string(),
        started_at,
        finished_at: Utc::now(),
        derive: None,
        mapping,
        unassigned: Vec::new(),
        remote: None,
        remote_error: None,
        local,
    };
    let run_dir = pipeline.write_reports(&report).await?;
    Ok(summarize(&report, &run_dir))
}

/// Full run: derive once, then both propagations against the same artifact.
pub async fn run_full(config: RunConfig) -> Result<RunSummary> {
    let pipeline = ReconcilePipeline::new(config);
    let started_at = Utc::now();
    let (stats, _, unassigned) = pipeline.derive().await?;
    let duplicates = stats.duplicates;

    // Both propagations read the artifact back; the artifact, not the
    // in-memory allocation, is the source of truth. They are independent:
    // a remote side that cannot even start is recorded in the report and
    // local patching proceeds regardless.
    let mapping = load_mapping_artifact(&pipeline.config().mapping_file).await?;
    let (remote, remote_error) = match pipeline.apply_remote(&mapping).await {
        Ok(summary) => (Some(summary), None),
        Err(err) => {
            let error = format!("{err:#}");
            warn!(error = %error, "remote propagation did not run; local patching continues");
            (None, Some(error))
        }
    };
    let local = pipeline.patch_local(&mapping).await?;

    let report = RunReport {
        run_id: Uuid::new_v4(),
        command: "run".to_string(),
        started_at,
        finished_at: Utc::now(),
        derive: Some(stats),
        mapping,
        unassigned,
        remote,
        remote_error,
        local,
    };
    let run_dir = pipeline.write_reports(&report).await?;

    if duplicates > 0 && report.mapping.is_empty() {
        bail!(
            "found {duplicates} duplicates but produced no mapping entries; \
             is the candidate pool empty?"
        );
    }
    Ok(summarize(&report, &run_dir))
}

pub async fn run_derive_from_env() -> Result<RunSummary> {
    run_derive(RunConfig::from_env()).await
}

pub async fn run_apply_remote_from_env() -> Result<RunSummary> {
    run_apply_remote(RunConfig::from_env()).await
}

pub async fn run_patch_local_from_env() -> Result<RunSummary> {
    run_patch_local(RunConfig::from_env()).await
}

pub async fn run_full_from_env() -> Result<RunSummary> {
    run_full(RunConfig::from_env()).await
}
