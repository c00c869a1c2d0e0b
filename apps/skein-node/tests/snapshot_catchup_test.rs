//! A follower that misses compacted entries catches up from a snapshot and
//! still ends up holding every record in its own store.

use skein_node::coordinator::ClusterCoordinator;
use skein_node::ingest::RecordSink;
use skein_node::record::IngestedRecord;
use skein_node::state_machine::{IngestStateMachine, RetryPolicy};
use skein_node::store::{MemoryRecordStore, RecordStore};
use skein_observe::NoopMeter;
use skein_raft::transport::{InMemoryTransport, RpcSender};
use skein_raft::{ConsensusEngine, LogIndex, NodeId, Raft, RaftConfig, ServerAddress};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const RECORDS: u64 = 20;

struct Member {
    id: NodeId,
    raft: Arc<Raft>,
    coordinator: Arc<ClusterCoordinator>,
    store: Arc<MemoryRecordStore>,
    transport: Arc<InMemoryTransport>,
    _dir: TempDir,
}

impl Member {
    fn last_snapshot_index(&self) -> LogIndex {
        self.raft.state().volatile_state().read().last_snapshot_index
    }

    async fn stored(&self) -> Vec<u64> {
        self.store
            .records()
            .await
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect()
    }
}

async fn create_members(size: usize) -> (Vec<Member>, HashMap<NodeId, RpcSender>) {
    let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(i.to_string())).collect();
    let config = RaftConfig {
        snapshot_entry_count: 5,
        ..RaftConfig::default()
    };

    let mut receivers = HashMap::new();
    let mut senders = HashMap::new();
    for id in &ids {
        let (tx, rx) = mpsc::channel(256);
        senders.insert(id.clone(), tx);
        receivers.insert(id.clone(), rx);
    }

    let mut members = Vec::new();
    for id in &ids {
        let peers: HashMap<NodeId, RpcSender> = senders
            .iter()
            .filter(|(peer, _)| *peer != id)
            .map(|(peer, tx)| (peer.clone(), tx.clone()))
            .collect();
        let transport = Arc::new(InMemoryTransport::new(id.clone(), peers));
        let store = Arc::new(MemoryRecordStore::new());
        let state_machine = Arc::new(IngestStateMachine::new(
            store.clone(),
            RetryPolicy::default(),
            Arc::new(NoopMeter),
        ));
        let dir = TempDir::new().unwrap();

        let raft = Raft::open(
            id.clone(),
            config.clone(),
            dir.path().join("raft"),
            transport.clone(),
            receivers.remove(id).unwrap(),
            state_machine.clone(),
            Arc::new(NoopMeter),
        )
        .await
        .unwrap();
        raft.start().unwrap();
        let raft = Arc::new(raft);

        members.push(Member {
            id: id.clone(),
            coordinator: Arc::new(ClusterCoordinator::new(
                raft.clone(),
                state_machine,
                Arc::new(NoopMeter),
            )),
            raft,
            store,
            transport,
            _dir: dir,
        });
    }

    (members, senders)
}

async fn wait_until<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_restored_from_snapshot_holds_every_record() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();

    let (members, senders) = create_members(3).await;
    let leader = &members[0];
    leader
        .raft
        .bootstrap(leader.id.clone(), ServerAddress::new("n1:9125"))
        .await
        .unwrap();
    wait_until("bootstrap leader", || async move { leader.coordinator.is_leader() }).await;
    for member in &members[1..] {
        leader
            .coordinator
            .join(
                ServerAddress::new(format!("n{}:9125", member.id)),
                member.id.clone(),
            )
            .await
            .unwrap();
    }

    // Cut n3 off while the leader ingests and compacts.
    let laggard = &members[2];
    for member in &members[..2] {
        member.transport.remove_peer(&laggard.id);
        laggard.transport.remove_peer(&member.id);
    }

    for seq in 1..=RECORDS {
        leader
            .coordinator
            .submit(IngestedRecord::new("feed", seq, format!("m{}", seq)))
            .await
            .unwrap();
    }
    wait_until("leader to compact past the laggard", || async move {
        leader.last_snapshot_index() > LogIndex(10)
    })
    .await;
    assert!(laggard.stored().await.len() < RECORDS as usize);

    for member in &members[..2] {
        member
            .transport
            .add_peer(laggard.id.clone(), senders[&laggard.id].clone());
        laggard
            .transport
            .add_peer(member.id.clone(), senders[&member.id].clone());
    }

    let expected: Vec<u64> = (1..=RECORDS).collect();
    let expected = &expected;
    for member in &members {
        wait_until("every store complete", || async move {
            member.stored().await == *expected
        })
        .await;
        assert_eq!(member.coordinator.watermark("feed"), Some(RECORDS));
    }
    assert!(laggard.last_snapshot_index() > LogIndex::ZERO);

    for member in &members {
        member.coordinator.close().await.unwrap();
    }
}
