// Bulk edit coordinator
//
// Applies one patch across a set of videos as independent per-video
// atomic updates: one video's failure never rolls back the others, and
// each id serializes against any concurrent single edit through the
// per-video lock.

use rusqlite::Connection;

use crate::db::schema::Video;
use crate::error::Result;
use crate::store::{update_video, VideoPatch};

#[derive(Debug, Clone)]
pub struct BulkEditRequest {
    pub add_tags: Vec<i64>,
    pub remove_tags: Vec<i64>,
    pub add_groups: Vec<i64>,
    pub remove_groups: Vec<i64>,
    pub set_profile: Option<i64>,
}

impl BulkEditRequest {
    fn to_patch(&self) -> VideoPatch {
        VideoPatch {
            add_tags: self.add_tags.clone(),
            remove_tags: self.remove_tags.clone(),
            add_groups: self.add_groups.clone(),
            remove_groups: self.remove_groups.clone(),
            set_profile: self.set_profile,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct BulkEditOutcome {
    pub video_id: i64,
    pub result: std::result::Result<Video, String>,
}

impl BulkEditOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Apply the request to each video independently, reporting per-id
/// success or failure. Result order follows the input ids.
pub fn bulk_edit(conn: &Connection, video_ids: &[i64], request: &BulkEditRequest) -> Result<Vec<BulkEditOutcome>> {
    let patch = request.to_patch();
    let mut outcomes = Vec::with_capacity(video_ids.len());

    for &video_id in video_ids {
        let result = match update_video(conn, video_id, &patch) {
            Ok(video) => Ok(video),
            Err(e) => {
                log::warn!("Bulk edit failed for video {}: {}", video_id, e);
                Err(e.to_string())
            }
        };
        outcomes.push(BulkEditOutcome { video_id, result });
    }

    Ok(outcomes)
}
