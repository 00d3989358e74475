//! End-to-end lifecycle scenarios against a temporary memory root
//!
//! Needs the scripted collaborators: `cargo test --features testing`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Local;
use tempfile::TempDir;

use oc_memory::merger::{CORE_CONTEXT, OBSERVATIONS_LOG};
use oc_memory::recovery::RECOVERED_DIR;
use oc_memory::testing::{MockCloudStore, MockExtractor, MockLlmClient, MockVault};
use oc_memory::{
    Category, Collaborators, Config, FileEventKind, Observation, Orchestrator, Priority,
};

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_memory_dir(dir.path().join("memory"));
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        Self { dir, config }
    }

    fn source(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join("watched").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn orchestrator(&self, collaborators: Collaborators) -> Orchestrator {
        Orchestrator::new(&self.config, collaborators).unwrap()
    }

    fn hot(&self) -> PathBuf {
        self.config.hot_dir()
    }
}

fn obs(id: &str, priority: Priority, category: Category, content: &str) -> Observation {
    Observation::new(id, priority, category, content).unwrap()
}

fn age(path: &Path, days: u64) {
    let then = SystemTime::now() - Duration::from_secs(days * 24 * 3600);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(then)
        .unwrap();
}

#[tokio::test]
async fn ingest_merges_observations_once() {
    let fx = Fixture::new();
    let batch = vec![
        obs("obs_1", Priority::High, Category::Decision, "Use PostgreSQL for the billing service"),
        obs("obs_2", Priority::Low, Category::Preference, "User prefers dark mode"),
    ];
    let extractor = Arc::new(MockExtractor::new(vec![batch.clone(), batch]));
    let orch = fx.orchestrator(Collaborators::default().with_extractor(extractor));

    let source = fx.source("session.md", "We will use PostgreSQL. Dark mode please.");
    let first = orch
        .on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();
    assert_eq!(first.extracted, 2);
    assert_eq!(first.merged, 2);
    assert!(first.hot_path.starts_with(fx.hot()));

    let second = orch
        .on_file_change(&source, FileEventKind::Modified)
        .await
        .unwrap();
    assert_eq!(second.extracted, 2);
    assert_eq!(second.merged, 0);

    let doc = orch.merger().load().unwrap();
    let log = doc.section(OBSERVATIONS_LOG).unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("- 🔴 ["));
    assert!(log[0].ends_with("**decision**: Use PostgreSQL for the billing service"));

    let counters = orch.counters();
    assert_eq!(counters.files_processed, 2);
    assert_eq!(counters.observations_extracted, 4);
    assert_eq!(counters.observations_merged, 2);
}

#[tokio::test]
async fn compression_shrinks_the_document() {
    let mut fx = Fixture::new();
    fx.config.reflection.max_tokens = 50;

    let llm = Arc::new(MockLlmClient::new(vec![
        "- 🔴 [2026-01-05 09:00] **decision**: Deploys happen on Tuesdays".to_string(),
    ]));
    let orch = fx.orchestrator(Collaborators::default().with_llm(llm.clone()));

    let observations: Vec<Observation> = (0..10)
        .map(|i| {
            obs(
                &format!("obs_{}", i),
                Priority::Medium,
                Category::Fact,
                &format!("Deployment note number {} says deploys happen on Tuesdays", i),
            )
        })
        .collect();
    orch.merger().add_observations(&observations).unwrap();

    let before = orch.merger().get_token_count().unwrap();
    let record = orch.run_compression().await.unwrap().unwrap();
    let after = orch.merger().get_token_count().unwrap();

    assert!(record.compression_ratio > 1.0);
    assert!(after < before);
    assert_eq!(llm.call_count(), 1);
    assert_eq!(orch.reflection_stats().unwrap().total_compressions, 1);
}

#[tokio::test]
async fn ineffective_compression_leaves_log_untouched() {
    let mut fx = Fixture::new();
    fx.config.reflection.max_tokens = 10;

    let padded = "- a much longer rewrite that is somehow bigger than what went in ".repeat(20);
    let llm = Arc::new(MockLlmClient::new(vec![padded]));
    let orch = fx.orchestrator(Collaborators::default().with_llm(llm));

    orch.merger()
        .add_observations(&[obs(
            "obs_1",
            Priority::Medium,
            Category::Task,
            "Renew the TLS certificate",
        )])
        .unwrap();
    let before = orch.merger().text().unwrap();

    let record = orch.run_compression().await.unwrap().unwrap();
    assert!(record.compression_ratio <= 1.0);
    assert_eq!(orch.merger().text().unwrap(), before);
}

#[tokio::test]
async fn stale_hot_file_moves_to_warm_once() {
    let fx = Fixture::new();
    let orch = fx.orchestrator(Collaborators::default());

    let old = fx.hot().join("projects/roadmap.md");
    std::fs::create_dir_all(old.parent().unwrap()).unwrap();
    std::fs::write(&old, "Q3 roadmap").unwrap();
    age(&old, 10);
    let fresh = fx.hot().join("projects/today.md");
    std::fs::write(&fresh, "today").unwrap();

    let report = orch.run_migration().unwrap();
    assert_eq!(report.hot_to_warm, 1);
    assert!(!old.exists());
    assert!(fresh.exists());

    let unit = fx
        .config
        .archive_dir()
        .join(Local::now().format("%Y-%m-%d").to_string())
        .join("projects/roadmap.md");
    assert_eq!(std::fs::read_to_string(unit).unwrap(), "Q3 roadmap");

    assert_eq!(orch.run_migration().unwrap().hot_to_warm, 0);
}

#[tokio::test]
async fn stale_observation_lines_move_to_warm() {
    let fx = Fixture::new();
    let orch = fx.orchestrator(Collaborators::default());

    let stale = obs("obs_1", Priority::Low, Category::Fact, "Office moved to Lisbon")
        .with_timestamp(Local::now() - chrono::Duration::days(30));
    let current = obs("obs_2", Priority::Low, Category::Fact, "Standup is at ten");
    orch.merger().add_observations(&[stale, current]).unwrap();

    let report = orch.run_migration().unwrap();
    assert_eq!(report.lines, 1);

    let log = orch.merger().load().unwrap();
    let log = log.section(OBSERVATIONS_LOG).unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("Standup is at ten"));

    let archived = fx
        .config
        .archive_dir()
        .join(Local::now().format("%Y-%m-%d").to_string())
        .join("fact/observations.md");
    assert!(std::fs::read_to_string(archived)
        .unwrap()
        .contains("Office moved to Lisbon"));
    assert_eq!(orch.run_migration().unwrap().hot_to_warm, 0);
}

#[tokio::test]
async fn unfamiliar_topic_is_recovered_from_vault() {
    let fx = Fixture::new();
    let note = fx.dir.path().join("vault/OC-Memory/kubernetes-upgrade.md");
    std::fs::create_dir_all(note.parent().unwrap()).unwrap();
    std::fs::write(&note, "# Kubernetes upgrade\nDrain nodes first.").unwrap();

    let vault = Arc::new(MockVault::with_notes(vec![note]));
    let extractor = Arc::new(MockExtractor::new(vec![vec![obs(
        "obs_1",
        Priority::High,
        Category::Task,
        "Schedule the kubernetes cluster upgrade window",
    )]]));
    let orch = fx.orchestrator(
        Collaborators::default()
            .with_extractor(extractor)
            .with_vault(vault.clone()),
    );

    let source = fx.source("ops.md", "we need to upgrade kubernetes");
    let report = orch
        .on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(vault.search_calls(), 1);
    let restored = fx.hot().join(RECOVERED_DIR).join("kubernetes-upgrade.md");
    assert_eq!(
        std::fs::read_to_string(restored).unwrap(),
        "# Kubernetes upgrade\nDrain nodes first."
    );
    assert_eq!(orch.counters().files_recovered, 1);
}

#[tokio::test]
async fn recovery_never_overwrites_hot_files() {
    let fx = Fixture::new();
    let note = fx.dir.path().join("vault/kubernetes-upgrade.md");
    std::fs::create_dir_all(note.parent().unwrap()).unwrap();
    std::fs::write(&note, "vault copy").unwrap();

    let existing = fx.hot().join("notes/kubernetes-upgrade.md");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, "local copy").unwrap();

    let extractor = Arc::new(MockExtractor::new(vec![vec![obs(
        "obs_1",
        Priority::Medium,
        Category::Fact,
        "Kubernetes upgrade requires draining nodes",
    )]]));
    let orch = fx.orchestrator(
        Collaborators::default()
            .with_extractor(extractor)
            .with_vault(Arc::new(MockVault::with_notes(vec![note]))),
    );

    let source = fx.source("ops.md", "upgrade talk");
    let report = orch
        .on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();

    assert_eq!(report.recovered, 0);
    assert_eq!(std::fs::read_to_string(&existing).unwrap(), "local copy");
    assert!(!fx.hot().join(RECOVERED_DIR).join("kubernetes-upgrade.md").exists());
}

#[tokio::test]
async fn unreachable_cold_tier_does_not_block_ingest() {
    let fx = Fixture::new();
    let vault = Arc::new(MockVault::failing());
    let cloud = Arc::new(MockCloudStore::failing());
    let extractor = Arc::new(MockExtractor::new(vec![vec![obs(
        "obs_1",
        Priority::High,
        Category::Task,
        "Rotate the grafana admin credentials",
    )]]));
    let orch = fx.orchestrator(
        Collaborators::default()
            .with_extractor(extractor)
            .with_vault(vault.clone())
            .with_cloud(cloud.clone()),
    );

    let source = fx.source("ops.md", "grafana creds are old");
    let report = orch
        .on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();

    assert_eq!(report.merged, 1);
    assert_eq!(report.recovered, 0);
    assert!(vault.search_calls() >= 1);
    assert!(cloud.lookup_calls() >= 1);
    assert!(!fx.hot().join(RECOVERED_DIR).exists());

    let doc = orch.merger().load().unwrap();
    assert!(doc.section(OBSERVATIONS_LOG).unwrap()[0].contains("grafana admin credentials"));
}

#[tokio::test]
async fn known_topic_skips_lookup() {
    let fx = Fixture::new();
    let vault = Arc::new(MockVault::with_notes(vec![]));
    let extractor = Arc::new(MockExtractor::new(vec![vec![obs(
        "obs_2",
        Priority::Medium,
        Category::Fact,
        "Billing service runs PostgreSQL replicas",
    )]]));
    let orch = fx.orchestrator(
        Collaborators::default()
            .with_extractor(extractor)
            .with_vault(vault.clone()),
    );
    orch.merger()
        .update(|doc| {
            doc.section_mut(CORE_CONTEXT)
                .push("The billing service uses PostgreSQL with two replicas".to_string())
        })
        .unwrap();

    let source = fx.source("db.md", "replicas");
    orch.on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();
    assert_eq!(vault.search_calls(), 0);
}

#[tokio::test]
async fn archived_material_returns_when_mentioned_again() {
    let fx = Fixture::new();
    let extractor = Arc::new(MockExtractor::new(vec![vec![obs(
        "obs_1",
        Priority::Medium,
        Category::Task,
        "Terraform modules need version pinning",
    )]]));
    let orch = fx.orchestrator(Collaborators::default().with_extractor(extractor));

    let old = fx.hot().join("documents/infra.md");
    std::fs::create_dir_all(old.parent().unwrap()).unwrap();
    std::fs::write(&old, "Notes on terraform modules and version pinning").unwrap();
    age(&old, 30);
    assert_eq!(orch.run_migration().unwrap().files, 1);
    assert!(!old.exists());

    let source = fx.source("infra-chat.md", "terraform again");
    let report = orch
        .on_file_change(&source, FileEventKind::Created)
        .await
        .unwrap();

    assert_eq!(report.recovered, 1);
    let restored = fx.hot().join(RECOVERED_DIR).join("infra.md");
    assert_eq!(
        std::fs::read_to_string(restored).unwrap(),
        "Notes on terraform modules and version pinning"
    );
}
