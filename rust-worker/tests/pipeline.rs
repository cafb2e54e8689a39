//! End-to-end pipeline runs over the in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::watch;

use mailqueue::queue::{Retention, StalledOutcome};
use mailqueue::worker::email_job_id;
use mailqueue::{
    CampaignJob, CampaignWorker, ComposeError, ComposedMessage, Delivery, EmailJob, EmailWorker,
    JobOptions, JobStatus, MailTransport, MemoryStore, MessageComposer, Producer, Queue,
    QueueSettings, QueueStore, SendError, CAMPAIGN_QUEUE, EMAIL_QUEUE,
};

/// Records every message handed to it, in order.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<EmailJob>>,
}

impl RecordingTransport {
    fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.subject.clone())
            .collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &EmailJob) -> Result<Delivery, SendError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(Delivery {
            message_id: Some(format!("<{}@mg>", email.subject)),
        })
    }
}

/// Renders a message for every subscriber.
struct EchoComposer;

#[async_trait]
impl MessageComposer for EchoComposer {
    async fn compose(
        &self,
        campaign_id: &str,
        subscriber_ids: &[String],
    ) -> Result<Vec<ComposedMessage>, ComposeError> {
        Ok(subscriber_ids
            .iter()
            .map(|id| ComposedMessage {
                subscriber_id: id.clone(),
                to: format!("{}@example.com", id),
                from: None,
                subject: format!("{}:{}", campaign_id, id),
                html: Some("<p>New listings this week</p>".to_string()),
                text: None,
                organization_id: None,
                personalization: Map::new(),
            })
            .collect())
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    emails: Queue<EmailJob>,
    campaigns: Queue<CampaignJob>,
    transport: Arc<RecordingTransport>,
}

impl Pipeline {
    fn new(email_settings: QueueSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            emails: Queue::new(EMAIL_QUEUE, store.clone(), email_settings),
            campaigns: Queue::new(CAMPAIGN_QUEUE, store.clone(), QueueSettings::campaign()),
            transport: Arc::new(RecordingTransport::default()),
            store,
        }
    }

    fn producer(&self) -> Producer {
        Producer::new(self.emails.clone(), self.campaigns.clone())
    }

    fn email_worker(&self) -> EmailWorker {
        EmailWorker::new(self.emails.clone(), self.transport.clone())
            .with_poll_interval(Duration::from_millis(5))
    }

    fn campaign_worker(&self) -> CampaignWorker {
        CampaignWorker::new(self.campaigns.clone(), self.emails.clone(), Arc::new(EchoComposer))
    }

    async fn drain_emails(&self) -> usize {
        let worker = self.email_worker();
        let mut processed = 0;
        while worker.run_once().await.unwrap() {
            processed += 1;
        }
        processed
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_sequential_worker_drains_high_priority_first() {
    let pipeline = Pipeline::new(QueueSettings::email());
    let producer = pipeline.producer();

    // Interleave so insertion order alone would mix the two classes.
    for i in 0..5 {
        let low = EmailJob::new("bulk@example.com", format!("p10-{}", i));
        producer
            .enqueue_bulk_emails(vec![(format!("low-{}", i), low)], 10)
            .await
            .unwrap();
        let high = EmailJob::new("vip@example.com", format!("p1-{}", i));
        producer
            .enqueue_bulk_emails(vec![(format!("high-{}", i), high)], 1)
            .await
            .unwrap();
    }

    assert_eq!(pipeline.drain_emails().await, 10);

    let subjects = pipeline.transport.subjects();
    assert_eq!(subjects.len(), 10);
    assert!(subjects[..5].iter().all(|s| s.starts_with("p1-")));
    assert!(subjects[5..].iter().all(|s| s.starts_with("p10-")));
    // Equal priority keeps insertion order.
    assert_eq!(subjects[0], "p1-0");
    assert_eq!(subjects[4], "p1-4");

    let stats = pipeline.emails.stats().await.unwrap();
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.total, 0);
    assert_eq!(stats.waiting + stats.active + stats.delayed, stats.total);
}

#[tokio::test]
async fn test_campaign_fans_out_and_delivers() {
    let pipeline = Pipeline::new(QueueSettings::email());
    let producer = pipeline.producer();

    let job_id = producer
        .enqueue_campaign("spring", ids(&["s1", "s2", "s3", "s2"]), Some(2))
        .await
        .unwrap();

    assert!(pipeline.campaign_worker().run_once().await.unwrap());
    let campaign = pipeline.campaigns.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(campaign.status, JobStatus::Completed);

    let stats = pipeline.emails.stats().await.unwrap();
    assert_eq!(stats.waiting, 3);

    for sub in ["s1", "s2", "s3"] {
        let job = pipeline
            .emails
            .get_job(&email_job_id("spring", sub))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.opts.priority, 2);
    }

    assert_eq!(pipeline.drain_emails().await, 3);

    let mut recipients: Vec<_> = pipeline
        .transport
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.to.clone())
        .collect();
    recipients.sort();
    assert_eq!(
        recipients,
        vec!["s1@example.com", "s2@example.com", "s3@example.com"]
    );

    let campaign_stats = pipeline.store.stats(CAMPAIGN_QUEUE).await.unwrap();
    assert_eq!(campaign_stats.completed, 1);
    assert_eq!(campaign_stats.failed, 0);
}

#[tokio::test]
async fn test_overlapping_campaigns_only_send_new_subscribers() {
    let pipeline = Pipeline::new(QueueSettings::email());
    let producer = pipeline.producer();
    let fanout = pipeline.campaign_worker();

    producer
        .enqueue_campaign("spring", ids(&["s1", "s2", "s3"]), None)
        .await
        .unwrap();
    fanout.run_once().await.unwrap();
    assert_eq!(pipeline.emails.stats().await.unwrap().waiting, 3);

    producer
        .enqueue_campaign("spring", ids(&["s2", "s3", "s4"]), None)
        .await
        .unwrap();
    fanout.run_once().await.unwrap();
    assert_eq!(pipeline.emails.stats().await.unwrap().waiting, 4);

    assert_eq!(pipeline.drain_emails().await, 4);
    assert_eq!(pipeline.transport.sent.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_stalled_job_is_finished_by_another_worker() {
    let pipeline = Pipeline::new(QueueSettings {
        lock_duration: Duration::from_millis(30),
        ..QueueSettings::email()
    });

    pipeline
        .emails
        .add(
            "e1",
            &EmailJob::new("buyer@example.com", "open-house"),
            JobOptions::default(),
        )
        .await
        .unwrap();

    // First worker leases the job and dies without renewing.
    let abandoned = pipeline.emails.lease().await.unwrap().unwrap();
    let stale_token = abandoned.token().to_string();
    drop(abandoned);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let recovered = pipeline.emails.detect_stalled().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].outcome, StalledOutcome::Requeued);

    assert!(pipeline.email_worker().run_once().await.unwrap());

    let job = pipeline.emails.get_job("e1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stalled_count, 1);
    assert_eq!(job.attempts_made, 0);

    // The original worker cannot commit with its old token.
    let late = pipeline
        .store
        .complete(EMAIL_QUEUE, "e1", &stale_token, Retention::KeepAll)
        .await;
    assert!(late.is_err());
}

#[tokio::test]
async fn test_concurrent_workers_deliver_each_job_once() {
    let pipeline = Pipeline::new(QueueSettings {
        remove_on_complete: Retention::KeepAll,
        ..QueueSettings::email()
    });
    let producer = pipeline.producer();

    let jobs = (0..100)
        .map(|i| {
            (
                format!("e{}", i),
                EmailJob::new("list@example.com", format!("msg-{}", i)),
            )
        })
        .collect();
    assert_eq!(producer.enqueue_bulk_emails(jobs, 0).await.unwrap(), 100);

    let (tx, rx) = watch::channel(false);
    let handles: Vec<_> = (0..8)
        .map(|_| tokio::spawn(pipeline.email_worker().run(rx.clone())))
        .collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = pipeline.emails.stats().await.unwrap();
        if stats.completed == 100 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers stalled: {:?}", stats);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut deliveries: HashMap<String, usize> = HashMap::new();
    for subject in pipeline.transport.subjects() {
        *deliveries.entry(subject).or_default() += 1;
    }
    assert_eq!(deliveries.len(), 100);
    assert!(deliveries.values().all(|&n| n == 1));
}
