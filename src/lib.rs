// TaktX: a private local archive for YouTube videos.
//
// The library root owns a content-addressed blob tree (blobs/) and a
// SQLite index (.taktx/taktx.db). Downloads run as durable jobs pulled
// through download -> trim -> index by the job engine.

pub mod adapters;
pub mod artifacts;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod hash;
pub mod jobs;
pub mod store;
pub mod tools;
