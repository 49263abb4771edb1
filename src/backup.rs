use crate::db::DB_FILE;
use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const SNAPSHOT_ENTRY: &str = "data/snapshot.json";
const DB_ENTRY: &str = "db/center.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "center-workspace-v1";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub class_count: i64,
    pub session_count: i64,
    pub attendance_count: i64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub class_count: i64,
    pub session_count: i64,
}

#[derive(Debug, PartialEq)]
enum PayloadKind {
    ZipBundle,
    BareSqlite,
    Unknown,
}

fn sniff_payload(path: &Path) -> anyhow::Result<PayloadKind> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut head = [0u8; 16];
    let read = f.read(&mut head).context("failed to read file header")?;
    if read >= 4 && head[..4] == ZIP_MAGIC {
        return Ok(PayloadKind::ZipBundle);
    }
    if read >= 16 && &head == SQLITE_MAGIC {
        return Ok(PayloadKind::BareSqlite);
    }
    Ok(PayloadKind::Unknown)
}

struct WorkspaceSnapshot {
    data: serde_json::Value,
    class_count: i64,
    session_count: i64,
    attendance_count: i64,
}

/// Reads the whole workspace into a JSON document. The snapshot rides along
/// inside the bundle next to the raw database so a backup stays inspectable
/// without sqlite tooling.
fn snapshot_workspace(db_path: &Path) -> anyhow::Result<WorkspaceSnapshot> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;

    let classes = collect_rows(
        &conn,
        "SELECT id, name, subject, room FROM classes ORDER BY name",
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "subject": r.get::<_, Option<String>>(2)?,
                "room": r.get::<_, Option<String>>(3)?,
            }))
        },
    )
    .context("failed to snapshot classes")?;

    let sessions = collect_rows(
        &conn,
        "SELECT id, class_id, session_date, start_time, end_time, status, note
         FROM class_sessions ORDER BY session_date, start_time",
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "sessionDate": r.get::<_, String>(2)?,
                "startTime": r.get::<_, String>(3)?,
                "endTime": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "note": r.get::<_, Option<String>>(6)?,
            }))
        },
    )
    .context("failed to snapshot sessions")?;

    let attendance = collect_rows(
        &conn,
        "SELECT session_id, student_id, code FROM session_attendance
         ORDER BY session_id, student_id",
        |r| {
            Ok(json!({
                "sessionId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
            }))
        },
    )
    .context("failed to snapshot attendance")?;

    let class_count = classes.len() as i64;
    let session_count = sessions.len() as i64;
    let attendance_count = attendance.len() as i64;
    Ok(WorkspaceSnapshot {
        data: json!({
            "classes": classes,
            "sessions": sessions,
            "attendance": attendance,
        }),
        class_count,
        session_count,
        attendance_count,
    })
}

fn collect_rows<F>(conn: &Connection, sql: &str, map: F) -> anyhow::Result<Vec<serde_json::Value>>
where
    F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_json_entry(
    zip: &mut ZipWriter<File>,
    opts: FileOptions,
    name: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start bundle entry {name}"))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize bundle entry {name}"))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write bundle entry {name}"))?;
    Ok(())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    let snapshot = snapshot_workspace(&db_path)?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "classCount": snapshot.class_count,
        "sessionCount": snapshot.session_count,
        "attendanceCount": snapshot.attendance_count,
    });
    write_json_entry(&mut zip, opts, MANIFEST_ENTRY, &manifest)?;
    write_json_entry(&mut zip, opts, SNAPSHOT_ENTRY, &snapshot.data)?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        class_count: snapshot.class_count,
        session_count: snapshot.session_count,
        attendance_count: snapshot.attendance_count,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE);

    let (detected, class_count, session_count) = match sniff_payload(in_path)? {
        PayloadKind::ZipBundle => {
            let (classes, sessions) = extract_bundle_db(in_path, workspace_path, &dst)?;
            (BUNDLE_FORMAT_V1.to_string(), classes, sessions)
        }
        PayloadKind::BareSqlite => {
            let (classes, sessions) = verify_restorable(in_path)?;
            std::fs::copy(in_path, &dst).with_context(|| {
                format!(
                    "failed to copy bare sqlite backup from {} to {}",
                    in_path.to_string_lossy(),
                    dst.to_string_lossy()
                )
            })?;
            ("bare-sqlite3".to_string(), classes, sessions)
        }
        PayloadKind::Unknown => {
            bail!(
                "unrecognized backup file {}: neither a workspace bundle nor a sqlite database",
                in_path.to_string_lossy()
            );
        }
    };

    Ok(ImportSummary {
        bundle_format_detected: detected,
        class_count,
        session_count,
    })
}

/// Opening and counting doubles as validation that the backup is actually
/// usable, not just bytes with the right header. Runs before the workspace
/// database is touched so a bad backup cannot clobber a good one.
fn verify_restorable(path: &Path) -> anyhow::Result<(i64, i64)> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("backup database cannot be opened")?;
    let class_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))
        .context("backup database has no classes table")?;
    let session_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM class_sessions", [], |r| r.get(0))
        .context("backup database has no class_sessions table")?;
    Ok((class_count, session_count))
}

fn extract_bundle_db(
    in_path: &Path,
    workspace_path: &Path,
    dst: &Path,
) -> anyhow::Result<(i64, i64)> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {format}");
    }

    let tmp_dst = workspace_path.join("center.sqlite3.importing");
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/center.sqlite3")?;
        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!(
                "failed to create temp database {}",
                tmp_dst.to_string_lossy()
            )
        })?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }

    if sniff_payload(&tmp_dst)? != PayloadKind::BareSqlite {
        let _ = std::fs::remove_file(&tmp_dst);
        bail!("bundle database entry is not a sqlite database");
    }
    let counts = match verify_restorable(&tmp_dst) {
        Ok(counts) => counts,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_dst);
            return Err(e);
        }
    };

    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;
    Ok(counts)
}
