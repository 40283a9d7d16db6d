use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use vodloader_core::config::{StoreBackend, StoreSection};
use vodloader_core::models::{
    BroadcastSession, Category, Channel, ChatMessage, LifecycleError, MetadataUpdate,
    RecordedPart,
};
use vodloader_core::store::{
    open_store, CaptureStore, ChannelFilter, MemoryCaptureStore, PartFilter, SessionFilter,
    SqliteCaptureStore, StoreError,
};

fn sqlite_store(dir: &Path) -> SqliteCaptureStore {
    let store = SqliteCaptureStore::builder()
        .path(dir.join("store.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn session(channel_id: &str, started_at: DateTime<Utc>) -> BroadcastSession {
    BroadcastSession {
        id: Uuid::new_v4(),
        channel_id: channel_id.into(),
        platform_stream_id: Some("stream-1".into()),
        title: Some("first title".into()),
        category: Some(Category {
            id: Some("509658".into()),
            name: "Just Chatting".into(),
        }),
        started_at,
        ended_at: None,
    }
}

fn part(session: &BroadcastSession, number: u32, started_at: DateTime<Utc>) -> RecordedPart {
    RecordedPart {
        id: Uuid::new_v4(),
        session_id: session.id,
        channel_id: session.channel_id.clone(),
        part_number: number,
        quality: "best".into(),
        path: PathBuf::from(format!("/downloads/c/{}.part{number:02}.ts", session.id)),
        started_at,
        ended_at: None,
        output_path: None,
    }
}

fn chat(id: &str, channel_id: &str, at: DateTime<Utc>) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        channel_id: channel_id.into(),
        author: "viewer".into(),
        text: format!("hello {id}"),
        color: Some("#ff0000".into()),
        badges: vec!["subscriber/12".into()],
        moderator: false,
        subscriber: true,
        first_message: false,
        timestamp: at,
    }
}

fn channel_round_trip(store: &dyn CaptureStore) {
    let mut channel = Channel::new("42", "somechannel");
    channel.display_name = Some("SomeChannel".into());
    channel.overlay.font_size = Some(18);
    channel.overlay.position = Some("bottom-right".into());
    store.save_channel(&channel).unwrap();

    let mut inactive = Channel::new("7", "quiet");
    inactive.active = false;
    store.save_channel(&inactive).unwrap();

    assert_eq!(store.get_channel("42").unwrap(), Some(channel.clone()));
    assert_eq!(store.list_channels(&ChannelFilter::default()).unwrap().len(), 2);
    let active = store
        .list_channels(&ChannelFilter { active_only: true })
        .unwrap();
    assert_eq!(active, vec![channel.clone()]);

    channel.quality = Some("720p".into());
    store.save_channel(&channel).unwrap();
    assert_eq!(
        store.get_channel("42").unwrap().unwrap().quality.as_deref(),
        Some("720p")
    );
    assert!(store.delete_channel("7").unwrap());
    assert!(!store.delete_channel("7").unwrap());
    assert!(store.get_channel("missing").unwrap().is_none());
}

fn session_life_cycle(store: &dyn CaptureStore) {
    store.save_channel(&Channel::new("42", "c")).unwrap();
    let first = session("42", t0());
    let second = session("42", t0() + Duration::hours(8));
    store.create_session(&second).unwrap();
    store.create_session(&first).unwrap();

    let listed = store
        .list_sessions(&SessionFilter {
            channel_id: Some("42".into()),
            ..SessionFilter::default()
        })
        .unwrap();
    assert_eq!(
        listed.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    let category = Category {
        id: None,
        name: "Art".into(),
    };
    store
        .update_session_metadata(first.id, Some("new title"), Some(&category))
        .unwrap();
    let updated = store.get_session(first.id).unwrap().unwrap();
    assert_eq!(updated.title.as_deref(), Some("new title"));
    assert_eq!(updated.category, Some(category.clone()));

    store.end_session(first.id, t0() + Duration::hours(1)).unwrap();
    let err = store
        .end_session(first.id, t0() + Duration::hours(2))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Lifecycle(LifecycleError::SessionAlreadyEnded(_))
    ));
    assert!(store
        .update_session_metadata(first.id, Some("late"), None)
        .is_err());
    assert_eq!(
        store.get_session(first.id).unwrap().unwrap().ended_at,
        Some(t0() + Duration::hours(1))
    );

    let open = store
        .list_sessions(&SessionFilter {
            channel_id: Some("42".into()),
            open_only: true,
            limit: None,
        })
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.id);

    let unknown = session("404", t0());
    assert!(matches!(
        store.create_session(&unknown),
        Err(StoreError::NotFound { .. })
    ));
}

fn part_finalization(store: &dyn CaptureStore) {
    store.save_channel(&Channel::new("42", "c")).unwrap();
    let session = session("42", t0());
    store.create_session(&session).unwrap();
    let second = part(&session, 2, t0() + Duration::hours(6));
    let first = part(&session, 1, t0());
    store.create_part(&second).unwrap();
    store.create_part(&first).unwrap();

    let end = t0() + Duration::hours(6);
    store.end_part(first.id, end).unwrap();
    let err = store.end_part(first.id, end + Duration::seconds(1)).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Lifecycle(LifecycleError::PartAlreadyEnded(_))
    ));
    let stored = store.get_part(first.id).unwrap().unwrap();
    assert_eq!(stored.ended_at, Some(end));
    assert!(matches!(
        store.end_part(second.id, t0()),
        Err(StoreError::Lifecycle(LifecycleError::EndBeforeStart(_)))
    ));

    let all = store
        .list_parts(&PartFilter {
            session_id: Some(session.id),
            ..PartFilter::default()
        })
        .unwrap();
    assert_eq!(
        all.iter().map(|p| p.part_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    let pending = store.list_parts(&PartFilter::pending_post_process()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first.id);

    store
        .set_part_output(first.id, Path::new("/downloads/c/out.mp4"))
        .unwrap();
    assert!(store
        .list_parts(&PartFilter::pending_post_process())
        .unwrap()
        .is_empty());
    assert!(store.delete_part(second.id).unwrap());
    assert!(store.get_part(second.id).unwrap().is_none());
}

fn chat_window(store: &dyn CaptureStore) {
    assert!(store.save_chat_message(&chat("b", "42", t0() + Duration::seconds(20))).unwrap());
    assert!(store.save_chat_message(&chat("a", "42", t0() + Duration::seconds(5))).unwrap());
    assert!(store.save_chat_message(&chat("c", "42", t0() + Duration::seconds(90))).unwrap());
    assert!(store.save_chat_message(&chat("z", "other", t0() + Duration::seconds(6))).unwrap());
    assert!(!store.save_chat_message(&chat("a", "42", t0())).unwrap());

    let window = store
        .chat_messages_between("42", t0(), t0() + Duration::seconds(60))
        .unwrap();
    assert_eq!(
        window.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(window[0].badges, vec!["subscriber/12".to_string()]);
    assert_eq!(window[0].timestamp, t0() + Duration::seconds(5));
}

fn metadata_updates(store: &dyn CaptureStore) {
    store.save_channel(&Channel::new("42", "c")).unwrap();
    let update = MetadataUpdate {
        id: Uuid::new_v4(),
        channel_id: "42".into(),
        title: Some("new".into()),
        category: None,
        recorded_at: t0(),
    };
    store.record_metadata_update(&update).unwrap();
}

fn run_all(store: &dyn CaptureStore) {
    channel_round_trip(store);
    session_life_cycle(store);
    part_finalization(store);
    chat_window(store);
    metadata_updates(store);
}

#[test]
fn sqlite_store_contract() {
    let dir = TempDir::new().unwrap();
    run_all(&sqlite_store(dir.path()));
}

#[test]
fn memory_store_contract() {
    let store = MemoryCaptureStore::new();
    run_all(&store);
    assert_eq!(store.metadata_updates("42").len(), 1);
}

#[test]
fn sqlite_store_survives_reopen_and_backup() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(dir.path());
    store.save_channel(&Channel::new("42", "c")).unwrap();
    let session = session("42", t0());
    store.create_session(&session).unwrap();

    let reopened = sqlite_store(dir.path());
    assert_eq!(reopened.get_session(session.id).unwrap(), Some(session));

    let backup = dir.path().join("backup.sqlite");
    store.backup_to(&backup).unwrap();
    let copy = SqliteCaptureStore::builder()
        .path(&backup)
        .create_if_missing(false)
        .build()
        .unwrap();
    assert!(copy.get_channel("42").unwrap().is_some());
}

#[test]
fn backend_is_selected_by_configuration() {
    let dir = TempDir::new().unwrap();
    let section = StoreSection {
        backend: StoreBackend::Sqlite,
        path: dir.path().join("configured.sqlite"),
    };
    let store = open_store(&section).unwrap();
    store.save_channel(&Channel::new("1", "a")).unwrap();
    assert!(section.path.exists());

    let memory = open_store(&StoreSection {
        backend: StoreBackend::Memory,
        path: dir.path().join("unused.sqlite"),
    })
    .unwrap();
    assert!(memory.get_channel("1").unwrap().is_none());
    assert!(!dir.path().join("unused.sqlite").exists());
}
