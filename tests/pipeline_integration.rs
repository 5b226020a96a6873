//! End-to-end pipeline tests over mock inbox and delivery transports.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use mailflow::config::EngineSettings;
use mailflow::delivery::{DeliveryAdapter, DeliveryRequest, DeliveryTransport};
use mailflow::error::{DeliveryError, WatcherError};
use mailflow::inbox::source::{FetchBatch, InboxSource};
use mailflow::inbox::watcher::BackoffPolicy;
use mailflow::inbox::{Attachment, Checkpoint, InboundMessage, InboxWatcher};
use mailflow::orchestrator::Orchestrator;
use mailflow::router::WorkflowRouter;
use mailflow::router::rules::{RoutingConfig, RuleConfig, RuleSet};
use mailflow::workflow::{AgentRegistry, WorkflowEngine};

struct ScriptedSource {
    batches: Mutex<Vec<FetchBatch>>,
}

#[async_trait]
impl InboxSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_since(&self, checkpoint: Checkpoint) -> Result<FetchBatch, WatcherError> {
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            return Ok(FetchBatch {
                messages: Vec::new(),
                checkpoint,
            });
        }
        Ok(batches.remove(0))
    }
}

#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<DeliveryRequest>>,
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn message(uid: u32, sender: &str, subject: &str, body: &str, pdf: bool) -> (InboundMessage, Checkpoint) {
    let attachments = if pdf {
        vec![Attachment {
            name: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 2048,
        }]
    } else {
        Vec::new()
    };
    (
        InboundMessage {
            id: format!("m-{uid}"),
            sender: sender.into(),
            subject: Some(subject.into()),
            body: body.into(),
            attachments,
            metadata: serde_json::json!({"uid": uid}),
            received_at: Utc::now(),
        },
        Checkpoint::new(1, uid),
    )
}

const DIGEST_WORKFLOW: &str = r#"
    [workflow]
    name = "daily-digest"
    version = "1"

    [[steps]]
    id = "ingested"
    agent = "ingest"
    outputs = ["document", "metadata"]

    [[steps]]
    id = "summary"
    agent = "template"
    input_from = "ingested"
    outputs = ["rendered"]

    [steps.config]
    template = "Digest: {metadata.subject}"

    [output]
    fields = ["summary.rendered"]
"#;

const REPORT_WORKFLOW: &str = r#"
    [workflow]
    name = "document-report"
    version = "1"

    [[steps]]
    id = "ingested"
    agent = "ingest"
    outputs = ["document", "metadata"]

    [[steps]]
    id = "report"
    agent = "template"
    input_from = "ingested"
    outputs = ["rendered"]

    [steps.config]
    template = "Report on {metadata.attachment_count} attachment(s) from {metadata.sender}"

    [output]
    fields = ["report.rendered"]
"#;

fn write_workflows(dir: &Path) {
    let workflows = dir.join("workflows");
    std::fs::create_dir_all(&workflows).unwrap();
    std::fs::write(workflows.join("daily-digest.toml"), DIGEST_WORKFLOW).unwrap();
    std::fs::write(workflows.join("document-report.toml"), REPORT_WORKFLOW).unwrap();
}

fn routing(dir: &Path) -> RoutingConfig {
    RoutingConfig {
        workflows_dir: dir.join("workflows"),
        default_workflow: "daily-digest.toml".into(),
        rules: vec![RuleConfig {
            name: "legal-reports".into(),
            workflow_path: "document-report.toml".into(),
            priority: 10,
            enabled: true,
            from_domain: vec!["legal.example.com".into()],
            from_email: vec![],
            subject_contains: vec!["report".into()],
            subject_regex: None,
            has_attachment: Some(true),
            attachment_type: vec!["pdf".into()],
            all_conditions: true,
        }],
    }
}

fn pipeline(dir: &Path, batches: Vec<FetchBatch>, transport: Arc<RecordingTransport>) -> Orchestrator {
    write_workflows(dir);
    let watcher = InboxWatcher::new(
        Arc::new(ScriptedSource {
            batches: Mutex::new(batches),
        }),
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        },
        Duration::from_millis(5),
    );
    Orchestrator::new(
        watcher,
        WorkflowRouter::new(RuleSet::compile(routing(dir))),
        WorkflowEngine::new(
            Arc::new(AgentRegistry::with_builtins()),
            EngineSettings::default(),
        ),
        DeliveryAdapter::new(transport, "team@example.com"),
        dir.join("workflows"),
        dir.join("checkpoint.json"),
        4,
    )
}

// A legal report with a PDF hits the report rule; plain chatter falls
// through to the digest default. Both runs deliver.
#[tokio::test]
async fn messages_route_to_distinct_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let batch = FetchBatch {
        messages: vec![
            message(
                1,
                "counsel@legal.example.com",
                "Quarterly report attached",
                "See attachment.",
                true,
            ),
            message(2, "someone@elsewhere.net", "random chatter", "hi there", false),
        ],
        checkpoint: Checkpoint::new(1, 2),
    };
    let orch = pipeline(dir.path(), vec![batch], transport.clone());

    let stats = orch.run_once().await.unwrap();
    assert_eq!(stats.messages_seen, 2);
    assert_eq!(stats.runs_succeeded, 2);
    assert_eq!(stats.deliveries_sent, 2);

    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].subject.contains("document-report"));
    assert!(requests[0].body.contains("Report on 1 attachment(s)"));
    assert!(requests[1].subject.contains("daily-digest"));
    assert!(requests[1].body.contains("Digest: random chatter"));
}

// A second orchestrator resuming from the persisted checkpoint asks the
// source only for newer mail.
#[tokio::test]
async fn checkpoint_survives_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let first_batch = FetchBatch {
        messages: vec![message(5, "a@b.com", "hello", "body text", false)],
        checkpoint: Checkpoint::new(1, 5),
    };
    let orch = pipeline(dir.path(), vec![first_batch], transport.clone());
    orch.run_once().await.unwrap();

    assert_eq!(
        Checkpoint::load(&dir.path().join("checkpoint.json")).unwrap(),
        Checkpoint::new(1, 5)
    );

    // Fresh pipeline, same checkpoint file, nothing new to fetch.
    let orch2 = pipeline(dir.path(), vec![], transport.clone());
    let stats = orch2.run_once().await.unwrap();
    assert_eq!(stats.messages_seen, 0);
    assert_eq!(transport.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn continuous_mode_processes_then_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let batch = FetchBatch {
        messages: vec![message(1, "x@y.com", "ping", "one two three", false)],
        checkpoint: Checkpoint::new(1, 1),
    };
    let orch = pipeline(dir.path(), vec![batch], transport.clone());

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let handle = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run_forever(stop_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.messages_seen, 1);
    assert_eq!(stats.runs_succeeded, 1);
    assert_eq!(transport.requests.lock().unwrap().len(), 1);
    assert_eq!(
        Checkpoint::load(&dir.path().join("checkpoint.json")).unwrap(),
        Checkpoint::new(1, 1)
    );
}
