use std::io::Write;
use std::path::Path;

use rusqlite::Connection;
use tempfile::TempDir;

use super::*;
use crate::artifacts::ArtifactStore;
use crate::db::{migrations, schema};
use crate::db::schema::NewVideo;
use crate::store::bulk::{bulk_edit, BulkEditRequest};

fn setup() -> (TempDir, Connection, ArtifactStore) {
    let tmp = TempDir::new().unwrap();
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    migrations::run_migrations(&conn).unwrap();
    let artifacts = ArtifactStore::new(tmp.path());
    (tmp, conn, artifacts)
}

/// Stage a file and put it, returning the fingerprint.
fn put_blob(dir: &Path, conn: &Connection, artifacts: &ArtifactStore, content: &[u8]) -> String {
    let staged = dir.join(format!("staged-{}.mp4", content.len()));
    let mut f = std::fs::File::create(&staged).unwrap();
    f.write_all(content).unwrap();
    artifacts.put(conn, &staged).unwrap().fingerprint
}

fn make_video(conn: &Connection, profile_id: i64, fingerprint: &str, title: &str) -> i64 {
    let video = create_video(
        conn,
        &NewVideo {
            profile_id,
            source_url: format!("https://youtube.com/watch?v={}", title),
            title: title.to_string(),
            description: String::new(),
            duration_secs: Some(120.0),
            clip_start_secs: None,
            clip_end_secs: None,
            fingerprint: fingerprint.to_string(),
            quality: "best".to_string(),
        },
        &[],
        &[],
    )
    .unwrap();
    video.id
}

#[test]
fn test_profile_name_conflict() {
    let (_tmp, conn, _artifacts) = setup();
    create_profile(&conn, "Main").unwrap();
    let err = create_profile(&conn, "Main").unwrap_err();
    assert!(matches!(err, TaktError::Conflict(_)), "got {:?}", err);
}

#[test]
fn test_group_unique_within_profile_only() {
    let (_tmp, conn, _artifacts) = setup();
    let a = create_profile(&conn, "A").unwrap();
    let b = create_profile(&conn, "B").unwrap();

    create_group(&conn, a.id, "concerts").unwrap();
    let err = create_group(&conn, a.id, "concerts").unwrap_err();
    assert!(matches!(err, TaktError::Conflict(_)));

    // Same name under another profile is fine
    create_group(&conn, b.id, "concerts").unwrap();
}

#[test]
fn test_tag_globally_unique() {
    let (_tmp, conn, _artifacts) = setup();
    create_tag(&conn, "gameplay").unwrap();
    let err = create_tag(&conn, "gameplay").unwrap_err();
    assert!(matches!(err, TaktError::Conflict(_)));
}

#[test]
fn test_create_group_requires_profile() {
    let (_tmp, conn, _artifacts) = setup();
    let err = create_group(&conn, 42, "nope").unwrap_err();
    assert!(matches!(err, TaktError::NotFound(_)));
}

#[test]
fn test_delete_profile_with_videos_rejected() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();
    let group = create_group(&conn, profile.id, "keep").unwrap();
    let tag = create_tag(&conn, "keep-tag").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"owned video");
    let video_id = make_video(&conn, profile.id, &fp, "owned");
    update_video(
        &conn,
        video_id,
        &VideoPatch {
            add_tags: vec![tag.id],
            add_groups: vec![group.id],
            ..Default::default()
        },
    )
    .unwrap();

    let err = delete_profile(&conn, profile.id).unwrap_err();
    assert!(matches!(err, TaktError::Conflict(_)));

    // Everything untouched
    let video = require_video(&conn, video_id).unwrap();
    assert_eq!(video.profile_id, profile.id);
    assert_eq!(video.tag_ids, vec![tag.id]);
    assert_eq!(video.group_ids, vec![group.id]);
    assert!(schema::get_group(&conn, group.id).unwrap().is_some());
    assert!(schema::get_tag(&conn, tag.id).unwrap().is_some());
}

#[test]
fn test_delete_empty_profile_removes_groups() {
    let (_tmp, conn, _artifacts) = setup();
    let profile = create_profile(&conn, "Empty").unwrap();
    let group = create_group(&conn, profile.id, "orphan-to-be").unwrap();

    delete_profile(&conn, profile.id).unwrap();
    assert!(schema::get_profile(&conn, profile.id).unwrap().is_none());
    assert!(schema::get_group(&conn, group.id).unwrap().is_none());
}

#[test]
fn test_create_video_rejects_foreign_group() {
    let (tmp, conn, artifacts) = setup();
    let a = create_profile(&conn, "A").unwrap();
    let b = create_profile(&conn, "B").unwrap();
    let foreign = create_group(&conn, b.id, "other").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"content");
    let err = create_video(
        &conn,
        &NewVideo {
            profile_id: a.id,
            source_url: "https://youtube.com/watch?v=x".to_string(),
            title: "x".to_string(),
            description: String::new(),
            duration_secs: None,
            clip_start_secs: None,
            clip_end_secs: None,
            fingerprint: fp,
            quality: "best".to_string(),
        },
        &[],
        &[foreign.id],
    )
    .unwrap_err();
    assert!(matches!(err, TaktError::Conflict(_)));
}

#[test]
fn test_update_video_fields_and_associations() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();
    let group = create_group(&conn, profile.id, "g").unwrap();
    let tag = create_tag(&conn, "t").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"video");
    let id = make_video(&conn, profile.id, &fp, "before");

    let video = update_video(
        &conn,
        id,
        &VideoPatch {
            title: Some("after".to_string()),
            description: Some("a clip".to_string()),
            add_tags: vec![tag.id],
            add_groups: vec![group.id],
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(video.title, "after");
    assert_eq!(video.description, "a clip");
    assert_eq!(video.tag_ids, vec![tag.id]);
    assert_eq!(video.group_ids, vec![group.id]);

    let video = update_video(
        &conn,
        id,
        &VideoPatch {
            remove_tags: vec![tag.id],
            remove_groups: vec![group.id],
            status: Some("archived".to_string()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(video.tag_ids.is_empty());
    assert!(video.group_ids.is_empty());
    assert_eq!(video.status, "archived");
}

#[test]
fn test_set_profile_clears_group_associations() {
    let (tmp, conn, artifacts) = setup();
    let a = create_profile(&conn, "A").unwrap();
    let b = create_profile(&conn, "B").unwrap();
    let group_a = create_group(&conn, a.id, "ga").unwrap();
    let tag = create_tag(&conn, "kept").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"movable");
    let id = make_video(&conn, a.id, &fp, "movable");
    update_video(
        &conn,
        id,
        &VideoPatch {
            add_groups: vec![group_a.id],
            add_tags: vec![tag.id],
            ..Default::default()
        },
    )
    .unwrap();

    let video = update_video(
        &conn,
        id,
        &VideoPatch {
            set_profile: Some(b.id),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(video.profile_id, b.id);
    assert!(video.group_ids.is_empty(), "old-profile groups cleared");
    assert_eq!(video.tag_ids, vec![tag.id], "global tags survive the move");
}

#[test]
fn test_delete_video_releases_artifact() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();

    // Two videos sharing one blob
    let fp = put_blob(tmp.path(), &conn, &artifacts, b"shared bytes");
    let fp2 = put_blob(tmp.path(), &conn, &artifacts, b"shared bytes");
    assert_eq!(fp, fp2);
    assert_eq!(artifacts.refcount(&conn, &fp).unwrap(), Some(2));

    let v1 = make_video(&conn, profile.id, &fp, "one");
    let v2 = make_video(&conn, profile.id, &fp, "two");

    delete_video(&conn, &artifacts, v1).unwrap();
    assert!(artifacts.exists(&conn, &fp).unwrap(), "still referenced by v2");
    assert_eq!(artifacts.refcount(&conn, &fp).unwrap(), Some(1));

    delete_video(&conn, &artifacts, v2).unwrap();
    assert!(!artifacts.exists(&conn, &fp).unwrap());
}

#[test]
fn test_query_filters() {
    let (tmp, conn, artifacts) = setup();
    let a = create_profile(&conn, "A").unwrap();
    let b = create_profile(&conn, "B").unwrap();
    let group = create_group(&conn, a.id, "g").unwrap();
    let tag = create_tag(&conn, "t").unwrap();

    let fp1 = put_blob(tmp.path(), &conn, &artifacts, b"first");
    let fp2 = put_blob(tmp.path(), &conn, &artifacts, b"second");
    let fp3 = put_blob(tmp.path(), &conn, &artifacts, b"third");

    let v1 = make_video(&conn, a.id, &fp1, "concert highlights");
    let _v2 = make_video(&conn, a.id, &fp2, "tutorial");
    let v3 = make_video(&conn, b.id, &fp3, "concert full");

    update_video(&conn, v1, &VideoPatch { add_tags: vec![tag.id], add_groups: vec![group.id], ..Default::default() }).unwrap();

    let by_profile = query_videos(&conn, &VideoQuery { profile_id: Some(a.id), ..Default::default() }).unwrap();
    assert_eq!(by_profile.len(), 2);

    let by_group = query_videos(&conn, &VideoQuery { group_id: Some(group.id), ..Default::default() }).unwrap();
    assert_eq!(by_group.len(), 1);
    assert_eq!(by_group[0].id, v1);

    let by_tag = query_videos(&conn, &VideoQuery { tag_id: Some(tag.id), ..Default::default() }).unwrap();
    assert_eq!(by_tag.len(), 1);

    let by_title = query_videos(&conn, &VideoQuery { title_contains: Some("concert".to_string()), ..Default::default() }).unwrap();
    assert_eq!(by_title.len(), 2);
    assert!(by_title.iter().all(|v| v.id == v1 || v.id == v3));

    let paged = query_videos(&conn, &VideoQuery { limit: Some(1), offset: 1, ..Default::default() }).unwrap();
    assert_eq!(paged.len(), 1);
}

#[test]
fn test_bulk_edit_partial_success() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();
    let tag = create_tag(&conn, "bulk").unwrap();

    let fp1 = put_blob(tmp.path(), &conn, &artifacts, b"v1");
    let fp2 = put_blob(tmp.path(), &conn, &artifacts, b"v2");
    let v1 = make_video(&conn, profile.id, &fp1, "one");
    let v2 = make_video(&conn, profile.id, &fp2, "two");
    let missing = 9_999;

    let outcomes = bulk_edit(
        &conn,
        &[v1, v2, missing],
        &BulkEditRequest {
            add_tags: vec![tag.id],
            remove_tags: vec![],
            add_groups: vec![],
            remove_groups: vec![],
            set_profile: None,
        },
    )
    .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].ok());
    assert!(outcomes[1].ok());
    assert!(!outcomes[2].ok(), "missing id reported, batch not aborted");

    // The successes stuck
    assert_eq!(require_video(&conn, v1).unwrap().tag_ids, vec![tag.id]);
    assert_eq!(require_video(&conn, v2).unwrap().tag_ids, vec![tag.id]);
}

#[test]
fn test_bulk_edit_foreign_group_fails_only_that_video() {
    let (tmp, conn, artifacts) = setup();
    let a = create_profile(&conn, "A").unwrap();
    let b = create_profile(&conn, "B").unwrap();
    let group_a = create_group(&conn, a.id, "only-a").unwrap();

    let fp1 = put_blob(tmp.path(), &conn, &artifacts, b"va");
    let fp2 = put_blob(tmp.path(), &conn, &artifacts, b"vb");
    let va = make_video(&conn, a.id, &fp1, "in-a");
    let vb = make_video(&conn, b.id, &fp2, "in-b");

    let outcomes = bulk_edit(
        &conn,
        &[va, vb],
        &BulkEditRequest {
            add_tags: vec![],
            remove_tags: vec![],
            add_groups: vec![group_a.id],
            remove_groups: vec![],
            set_profile: None,
        },
    )
    .unwrap();

    assert!(outcomes[0].ok());
    assert!(!outcomes[1].ok());
    assert!(outcomes[1].result.as_ref().unwrap_err().contains("Conflict"));
}

#[test]
fn test_verify_index_reports_missing_blob() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"will vanish");
    let id = make_video(&conn, profile.id, &fp, "vanishing");

    let clean = verify_index(&conn, &artifacts).unwrap();
    assert_eq!(clean.checked, 1);
    assert!(clean.broken.is_empty());

    let artifact = schema::get_artifact(&conn, &fp).unwrap().unwrap();
    std::fs::remove_file(artifacts.full_path(&artifact.rel_path)).unwrap();

    let report = verify_index(&conn, &artifacts).unwrap();
    assert_eq!(report.broken.len(), 1);
    assert_eq!(report.broken[0].0, id);
}

#[test]
fn test_verify_index_reports_corrupted_blob() {
    let (tmp, conn, artifacts) = setup();
    let profile = create_profile(&conn, "Main").unwrap();

    let fp = put_blob(tmp.path(), &conn, &artifacts, b"pristine bytes");
    let id = make_video(&conn, profile.id, &fp, "bitrotten");

    let artifact = schema::get_artifact(&conn, &fp).unwrap().unwrap();
    std::fs::write(artifacts.full_path(&artifact.rel_path), b"flipped bits").unwrap();

    let report = verify_index(&conn, &artifacts).unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.broken.len(), 1);
    assert_eq!(report.broken[0].0, id);
    assert!(report.broken[0].1.contains("fingerprint mismatch"));
}
