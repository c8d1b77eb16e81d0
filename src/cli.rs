// TaktX command-line interface

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use taktx::adapters::{Downloader, YtDlpDownloader};
use taktx::artifacts::ArtifactStore;
use taktx::config::Config;
use taktx::constants::QUALITY_PROFILES;
use taktx::db;
use taktx::db::schema::{self, JobState, Video};
use taktx::error::{Result, TaktError};
use taktx::jobs::{self, JobEngine, SubmitRequest};
use taktx::store;
use taktx::store::bulk::{bulk_edit, BulkEditRequest};
use taktx::store::{VideoPatch, VideoQuery};
use taktx::tools;

#[derive(Parser)]
#[command(name = "taktx", version, about = "Private local archive for YouTube videos")]
struct Cli {
    /// Library root directory
    #[arg(long, global = true, default_value = ".")]
    library: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a library in the target directory
    Init,

    /// Queue a download job
    Submit {
        url: String,
        /// Profile that will own the archived video
        #[arg(short, long)]
        profile: String,
        /// Clip start in seconds
        #[arg(long)]
        start: Option<f64>,
        /// Clip end in seconds
        #[arg(long)]
        end: Option<f64>,
        /// Quality profile (see `taktx qualities`)
        #[arg(short, long)]
        quality: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// Tag to attach on completion (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Group to attach on completion (repeatable, must belong to the profile)
        #[arg(long = "group")]
        groups: Vec<String>,
    },

    /// Recover interrupted jobs and work the queue until empty
    Work,

    /// List jobs
    Jobs {
        /// Filter by state (queued, downloading, ..., cancelled)
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Delete terminal jobs older than the retention window
        #[arg(long)]
        prune: bool,
    },

    /// Show one job
    Status { job_id: i64 },

    /// Cancel a queued or running job
    Cancel { job_id: i64 },

    /// List archived videos
    List {
        #[arg(short, long)]
        profile: Option<String>,
        /// Group name; requires --profile
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        /// Substring match on title
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show one video
    Show { video_id: i64 },

    /// Edit a video's metadata and associations
    Edit {
        video_id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// complete, failed, or archived
        #[arg(long)]
        status: Option<String>,
        /// Move to another profile (clears group associations)
        #[arg(long)]
        set_profile: Option<String>,
        #[arg(long = "add-tag")]
        add_tags: Vec<String>,
        #[arg(long = "remove-tag")]
        remove_tags: Vec<String>,
        #[arg(long = "add-group")]
        add_groups: Vec<String>,
        #[arg(long = "remove-group")]
        remove_groups: Vec<String>,
    },

    /// Apply one edit across many videos; failures are per-video
    BulkEdit {
        /// Video ids (repeatable)
        #[arg(long = "id", required = true)]
        ids: Vec<i64>,
        #[arg(long = "add-tag")]
        add_tags: Vec<String>,
        #[arg(long = "remove-tag")]
        remove_tags: Vec<String>,
        /// Group id (repeatable)
        #[arg(long = "add-group")]
        add_groups: Vec<i64>,
        #[arg(long = "remove-group")]
        remove_groups: Vec<i64>,
        #[arg(long)]
        set_profile: Option<String>,
    },

    /// Delete a video and release its stored blob
    Delete { video_id: i64 },

    /// Probe whether a video's source is still available upstream
    Check { video_id: i64 },

    /// Fetch source metadata for a URL without downloading
    Inspect { url: String },

    /// Manage profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Manage groups (profile-scoped)
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Manage tags (global)
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// List quality profiles
    Qualities,

    /// Check index/blob consistency
    Verify,

    /// Remove orphaned blob files
    Gc,

    /// Report external tool availability
    Doctor,
}

#[derive(Subcommand)]
enum ProfileAction {
    Add { name: String },
    List,
    Remove { name: String },
}

#[derive(Subcommand)]
enum GroupAction {
    Add {
        #[arg(short, long)]
        profile: String,
        name: String,
    },
    List {
        #[arg(short, long)]
        profile: String,
    },
    Remove {
        #[arg(short, long)]
        profile: String,
        name: String,
    },
}

#[derive(Subcommand)]
enum TagAction {
    Add { name: String },
    List,
    Remove { name: String },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_library(library: &Path) -> Result<Connection> {
    if !db::get_taktx_path(library).exists() {
        return Err(TaktError::InvalidArgument(format!(
            "{} is not a TaktX library (run 'taktx init' first)",
            library.display()
        )));
    }
    db::open_db(&db::get_db_path(library)).map_err(TaktError::from)
}

fn profile_by_name(conn: &Connection, name: &str) -> Result<schema::Profile> {
    schema::get_profile_by_name(conn, name)?
        .ok_or_else(|| TaktError::NotFound(format!("profile '{}'", name)))
}

fn group_by_name(conn: &Connection, profile_id: i64, name: &str) -> Result<schema::Group> {
    schema::get_group_by_name(conn, profile_id, name)?
        .ok_or_else(|| TaktError::NotFound(format!("group '{}'", name)))
}

fn tag_by_name(conn: &Connection, name: &str) -> Result<schema::Tag> {
    schema::get_tag_by_name(conn, name)?
        .ok_or_else(|| TaktError::NotFound(format!("tag '{}'", name)))
}

fn run(cli: Cli) -> Result<()> {
    let library = cli.library;

    match cli.command {
        Command::Init => {
            db::init_library_folders(&library).map_err(TaktError::from)?;
            db::open_db(&db::get_db_path(&library)).map_err(TaktError::from)?;
            let config_path = db::get_taktx_path(&library).join(taktx::constants::CONFIG_FILENAME);
            if !config_path.exists() {
                Config::default().save(&library)?;
            }
            println!("Initialized TaktX library at {}", library.display());
        }

        Command::Submit {
            url,
            profile,
            start,
            end,
            quality,
            title,
            tags,
            groups,
        } => {
            let conn = open_library(&library)?;
            let config = Config::load(&library)?;
            let profile = profile_by_name(&conn, &profile)?;
            let mut group_ids = Vec::with_capacity(groups.len());
            for name in &groups {
                group_ids.push(group_by_name(&conn, profile.id, name)?.id);
            }

            let outcome = jobs::submit(
                &conn,
                &config,
                &SubmitRequest {
                    url,
                    profile_id: profile.id,
                    clip_start_secs: start,
                    clip_end_secs: end,
                    quality,
                    title,
                    tags,
                    group_ids,
                },
            )?;
            if outcome.deduplicated {
                println!("Already in flight as job {}", outcome.job_id);
            } else {
                println!("Queued job {}", outcome.job_id);
            }
        }

        Command::Work => {
            let conn = open_library(&library)?;
            drop(conn);
            let config = Config::load(&library)?;
            let engine = JobEngine::with_default_tools(&library, config);
            let summary = engine.run()?;
            println!(
                "Done: {} completed, {} failed, {} cancelled",
                summary.completed, summary.failed, summary.cancelled
            );
        }

        Command::Jobs { state, limit, prune } => {
            let conn = open_library(&library)?;
            if prune {
                let config = Config::load(&library)?;
                let removed = jobs::prune_terminal(&conn, config.job_retention_days)?;
                println!("Pruned {} terminal job(s)", removed);
                return Ok(());
            }

            let state = match state {
                Some(s) => Some(JobState::parse(&s).ok_or_else(|| {
                    TaktError::InvalidArgument(format!("unknown job state '{}'", s))
                })?),
                None => None,
            };
            let listed = schema::list_jobs(&conn, state, limit)?;
            for job in &listed {
                println!(
                    "{:>6}  {:<12} attempts={} {}",
                    job.id, job.state, job.attempts, job.url
                );
            }
            println!("{} job(s)", listed.len());
        }

        Command::Status { job_id } => {
            let conn = open_library(&library)?;
            let job = schema::get_job(&conn, job_id)?
                .ok_or_else(|| TaktError::NotFound(format!("job {}", job_id)))?;
            println!("Job {}", job.id);
            println!("  url:        {}", job.url);
            println!("  state:      {}", job.state);
            println!("  clip:       {}", job.clip_key);
            println!("  attempts:   {}", job.attempts);
            if let Some(err) = &job.last_error {
                println!("  last error: {}", err);
            }
            if let Some(worker) = &job.claimed_by {
                println!("  worker:     {}", worker);
            }
            if let Some(video_id) = job.video_id {
                println!("  video:      {}", video_id);
            }
            println!("  created:    {}", job.created_at);
            if let Some(done) = &job.completed_at {
                println!("  finished:   {}", done);
            }
        }

        Command::Cancel { job_id } => {
            let conn = open_library(&library)?;
            match jobs::cancel_job(&conn, job_id)? {
                jobs::CancelOutcome::Cancelled => println!("Cancelled job {}", job_id),
                jobs::CancelOutcome::Requested => {
                    println!("Cancellation requested for running job {}", job_id)
                }
            }
        }

        Command::List {
            profile,
            group,
            tag,
            title,
            status,
            limit,
            offset,
        } => {
            let conn = open_library(&library)?;

            let profile_row = match &profile {
                Some(name) => Some(profile_by_name(&conn, name)?),
                None => None,
            };
            let group_id = match &group {
                Some(name) => {
                    let profile_row = profile_row.as_ref().ok_or_else(|| {
                        TaktError::InvalidArgument("--group requires --profile".to_string())
                    })?;
                    Some(group_by_name(&conn, profile_row.id, name)?.id)
                }
                None => None,
            };
            let tag_id = match &tag {
                Some(name) => Some(tag_by_name(&conn, name)?.id),
                None => None,
            };

            let videos = store::query_videos(
                &conn,
                &VideoQuery {
                    profile_id: profile_row.map(|p| p.id),
                    group_id,
                    tag_id,
                    title_contains: title,
                    status,
                    limit: Some(limit),
                    offset,
                },
            )?;
            for v in &videos {
                println!("{:>6}  {:<9} {}", v.id, v.status, v.title);
            }
            println!("{} video(s)", videos.len());
        }

        Command::Show { video_id } => {
            let conn = open_library(&library)?;
            let video = store::require_video(&conn, video_id)?;
            print_video(&conn, &video)?;
        }

        Command::Edit {
            video_id,
            title,
            description,
            status,
            set_profile,
            add_tags,
            remove_tags,
            add_groups,
            remove_groups,
        } => {
            let conn = open_library(&library)?;
            let video = store::require_video(&conn, video_id)?;

            let set_profile = match &set_profile {
                Some(name) => Some(profile_by_name(&conn, name)?.id),
                None => None,
            };
            // Group names resolve against the profile the video will end
            // up in.
            let group_scope = set_profile.unwrap_or(video.profile_id);

            let mut patch = VideoPatch {
                title,
                description,
                status,
                set_profile,
                ..Default::default()
            };
            for name in &add_tags {
                patch.add_tags.push(store::get_or_create_tag(&conn, name)?.id);
            }
            for name in &remove_tags {
                patch.remove_tags.push(tag_by_name(&conn, name)?.id);
            }
            for name in &add_groups {
                patch.add_groups.push(group_by_name(&conn, group_scope, name)?.id);
            }
            for name in &remove_groups {
                patch
                    .remove_groups
                    .push(group_by_name(&conn, group_scope, name)?.id);
            }

            let updated = store::update_video(&conn, video_id, &patch)?;
            print_video(&conn, &updated)?;
        }

        Command::BulkEdit {
            ids,
            add_tags,
            remove_tags,
            add_groups,
            remove_groups,
            set_profile,
        } => {
            let conn = open_library(&library)?;

            let set_profile = match &set_profile {
                Some(name) => Some(profile_by_name(&conn, name)?.id),
                None => None,
            };
            let mut request = BulkEditRequest {
                add_tags: Vec::new(),
                remove_tags: Vec::new(),
                add_groups,
                remove_groups,
                set_profile,
            };
            for name in &add_tags {
                request.add_tags.push(store::get_or_create_tag(&conn, name)?.id);
            }
            for name in &remove_tags {
                request.remove_tags.push(tag_by_name(&conn, name)?.id);
            }

            let outcomes = bulk_edit(&conn, &ids, &request)?;
            let mut edited = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(_) => edited += 1,
                    Err(e) => println!("video {}: FAILED ({})", outcome.video_id, e),
                }
            }
            println!("Edited {}/{} video(s)", edited, outcomes.len());
        }

        Command::Delete { video_id } => {
            let conn = open_library(&library)?;
            let artifacts = ArtifactStore::new(&library);
            store::delete_video(&conn, &artifacts, video_id)?;
            println!("Deleted video {}", video_id);
        }

        Command::Check { video_id } => {
            let conn = open_library(&library)?;
            let video = store::require_video(&conn, video_id)?;
            let config = Config::load(&library)?;
            let downloader = YtDlpDownloader::new(std::time::Duration::from_secs(
                config.download.timeout_secs,
            ));
            let available = downloader.probe_source(&video.source_url)?;
            store::mark_source_status(&conn, video_id, available)?;
            if available {
                println!("Source still available: {}", video.source_url);
            } else {
                println!("Source gone: {}", video.source_url);
            }
        }

        Command::Inspect { url } => {
            let config = Config::load(&library).unwrap_or_default();
            let downloader = YtDlpDownloader::new(std::time::Duration::from_secs(
                config.download.timeout_secs,
            ));
            let info = downloader.analyze(&url)?;
            println!("title:    {}", info.title.as_deref().unwrap_or("(unknown)"));
            match info.duration_secs {
                Some(d) => println!("duration: {:.1}s", d),
                None => println!("duration: (unknown)"),
            }
        }

        Command::Profile { action } => {
            let conn = open_library(&library)?;
            match action {
                ProfileAction::Add { name } => {
                    let profile = store::create_profile(&conn, &name)?;
                    println!("Created profile {} (id {})", profile.name, profile.id);
                }
                ProfileAction::List => {
                    for p in schema::list_profiles(&conn)? {
                        let count = schema::count_profile_videos(&conn, p.id)?;
                        println!("{:>4}  {:<24} {} video(s)", p.id, p.name, count);
                    }
                }
                ProfileAction::Remove { name } => {
                    let profile = profile_by_name(&conn, &name)?;
                    store::delete_profile(&conn, profile.id)?;
                    println!("Removed profile {}", name);
                }
            }
        }

        Command::Group { action } => {
            let conn = open_library(&library)?;
            match action {
                GroupAction::Add { profile, name } => {
                    let profile = profile_by_name(&conn, &profile)?;
                    let group = store::create_group(&conn, profile.id, &name)?;
                    println!("Created group {} (id {})", group.name, group.id);
                }
                GroupAction::List { profile } => {
                    let profile = profile_by_name(&conn, &profile)?;
                    for g in schema::list_groups(&conn, profile.id)? {
                        let count = schema::count_group_videos(&conn, g.id)?;
                        println!("{:>4}  {:<24} {} video(s)", g.id, g.name, count);
                    }
                }
                GroupAction::Remove { profile, name } => {
                    let profile = profile_by_name(&conn, &profile)?;
                    let group = group_by_name(&conn, profile.id, &name)?;
                    store::delete_group(&conn, group.id)?;
                    println!("Removed group {}", name);
                }
            }
        }

        Command::Tag { action } => {
            let conn = open_library(&library)?;
            match action {
                TagAction::Add { name } => {
                    let tag = store::create_tag(&conn, &name)?;
                    println!("Created tag {} (id {})", tag.name, tag.id);
                }
                TagAction::List => {
                    for t in schema::list_tags(&conn)? {
                        let count = schema::count_tag_videos(&conn, t.id)?;
                        println!("{:>4}  {:<24} {} video(s)", t.id, t.name, count);
                    }
                }
                TagAction::Remove { name } => {
                    let tag = tag_by_name(&conn, &name)?;
                    store::delete_tag(&conn, tag.id)?;
                    println!("Removed tag {}", name);
                }
            }
        }

        Command::Qualities => {
            for (name, format) in QUALITY_PROFILES {
                println!("{:<12} {}", name, format);
            }
        }

        Command::Verify => {
            let conn = open_library(&library)?;
            let artifacts = ArtifactStore::new(&library);
            let report = store::verify_index(&conn, &artifacts)?;
            for (video_id, reason) in &report.broken {
                println!("video {}: {}", video_id, reason);
            }
            println!(
                "Checked {} video(s), {} broken ({})",
                report.checked,
                report.broken.len(),
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
        }

        Command::Gc => {
            let conn = open_library(&library)?;
            let artifacts = ArtifactStore::new(&library);
            let report = artifacts.cleanup_orphans(&conn)?;
            for missing in &report.missing_blobs {
                println!("missing blob for {}", missing);
            }
            println!(
                "Removed {} orphaned file(s), {} blob(s) missing",
                report.removed_files.len(),
                report.missing_blobs.len()
            );
        }

        Command::Doctor => {
            for tool in ["yt-dlp", "ffmpeg", "ffprobe"] {
                let ok = tools::is_tool_available(tool);
                println!("{:<10} {}", tool, if ok { "ok" } else { "NOT FOUND" });
            }
        }
    }

    Ok(())
}

fn print_video(conn: &Connection, video: &Video) -> Result<()> {
    println!("Video {} ({})", video.id, video.uuid);
    println!("  title:       {}", video.title);
    if !video.description.is_empty() {
        println!("  description: {}", video.description);
    }
    println!("  url:         {}", video.source_url);
    println!("  status:      {}", video.status);
    println!("  source:      {}", video.source_status);
    if let Some(checked) = &video.last_checked_at {
        println!("  checked at:  {}", checked);
    }
    if let Some(d) = video.duration_secs {
        println!("  duration:    {:.1}s", d);
    }
    if let (Some(s), Some(e)) = (video.clip_start_secs, video.clip_end_secs) {
        println!("  clip:        {:.1}s - {:.1}s", s, e);
    }
    println!("  quality:     {}", video.quality);
    println!("  file:        {}", video.file_path);
    println!("  fingerprint: {}", video.fingerprint);

    if let Some(profile) = schema::get_profile(conn, video.profile_id)? {
        println!("  profile:     {}", profile.name);
    }
    if !video.tag_ids.is_empty() {
        let mut names = Vec::new();
        for &tag_id in &video.tag_ids {
            if let Some(tag) = schema::get_tag(conn, tag_id)? {
                names.push(tag.name);
            }
        }
        println!("  tags:        {}", names.join(", "));
    }
    if !video.group_ids.is_empty() {
        let mut names = Vec::new();
        for &group_id in &video.group_ids {
            if let Some(group) = schema::get_group(conn, group_id)? {
                names.push(group.name);
            }
        }
        println!("  groups:      {}", names.join(", "));
    }
    Ok(())
}
