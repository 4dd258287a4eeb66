// dbbackup/src/backup/db_dump.rs
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::BackupJob;
use crate::config::{Engine, EngineSettings, MongoSettings, Password, Settings, redact_uri};
use crate::errors::{AppError, Result};
use crate::utils::find_executable;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Produces the local artifact for one backup job.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, job: &BackupJob) -> Result<()>;
}

/// A fully resolved dump invocation. Secrets only travel in `env`, never in `args`.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, Password)>,
}

impl DumpCommand {
    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value.expose());
        }
        cmd
    }
}

pub fn mysql_command(program: PathBuf, settings: &EngineSettings, ssl_mode: Option<&str>) -> DumpCommand {
    let cred = &settings.credential;
    let mut args: Vec<String> = [
        "--all-databases",
        "--single-transaction",
        "--quick",
        "--routines",
        "--events",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--host={}", cred.host));
    args.push(format!("--port={}", cred.port));
    args.push(format!("--user={}", cred.user));
    if let Some(mode) = ssl_mode {
        if is_mariadb_client(&program) {
            args.extend(mariadb_tls_args(mode));
        } else {
            args.push(format!("--ssl-mode={}", mode));
        }
    }

    DumpCommand {
        tool: tool_name(&program, "mysqldump"),
        program,
        args,
        env: settings.password.iter().map(|p| ("MYSQL_PWD", p.clone())).collect(),
    }
}

/// MariaDB clients reject `--ssl-mode`. Debian ships `mysqldump` as a link to them.
pub fn is_mariadb_client(program: &Path) -> bool {
    let named_mariadb = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase().contains("mariadb"))
            .unwrap_or(false)
    };
    named_mariadb(program)
        || fs::canonicalize(program)
            .map(|target| named_mariadb(&target))
            .unwrap_or(false)
}

/// Translates a MySQL `--ssl-mode` value into MariaDB client flags.
fn mariadb_tls_args(mode: &str) -> Vec<String> {
    let flags: &[&str] = match mode.to_ascii_uppercase().as_str() {
        "DISABLED" => &["--skip-ssl"],
        "PREFERRED" => &[],
        "VERIFY_CA" | "VERIFY_IDENTITY" => &["--ssl", "--ssl-verify-server-cert"],
        _ => &["--ssl"],
    };
    flags.iter().map(|f| f.to_string()).collect()
}

pub fn postgres_command(program: PathBuf, settings: &EngineSettings) -> DumpCommand {
    let cred = &settings.credential;
    DumpCommand {
        tool: tool_name(&program, "pg_dumpall"),
        program,
        args: vec![
            "--no-password".to_string(),
            "-h".to_string(),
            cred.host.clone(),
            "-p".to_string(),
            cred.port.clone(),
            "-U".to_string(),
            cred.user.clone(),
        ],
        env: settings.password.iter().map(|p| ("PGPASSWORD", p.clone())).collect(),
    }
}

/// mongodump writes and compresses the archive itself. The URI and password
/// are read from `config_path` so they stay out of the process list.
pub fn mongo_command(
    program: PathBuf,
    settings: &MongoSettings,
    archive_path: &Path,
    config_path: Option<&Path>,
) -> DumpCommand {
    let mut args = vec![format!("--archive={}", archive_path.display()), "--gzip".to_string()];
    if settings.uri.is_none() {
        let cred = &settings.credential;
        args.push(format!("--host={}", cred.host));
        args.push(format!("--port={}", cred.port));
        args.push(format!("--username={}", cred.user));
        args.push(format!("--authenticationDatabase={}", settings.auth_db));
    }
    if let Some(path) = config_path {
        args.push(format!("--config={}", path.display()));
    }

    DumpCommand {
        tool: tool_name(&program, "mongodump"),
        program,
        args,
        env: Vec::new(),
    }
}

fn yaml_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Body of the mongodump `--config` file, or `None` when there is nothing secret to pass.
pub fn mongo_config_yaml(settings: &MongoSettings) -> Option<String> {
    let mut body = String::new();
    if let Some(uri) = &settings.uri {
        body.push_str(&format!("uri: {}\n", yaml_quote(uri)));
    }
    if let Some(password) = &settings.password {
        body.push_str(&format!("password: {}\n", yaml_quote(password.expose())));
    }
    (!body.is_empty()).then_some(body)
}

fn write_mongo_config(settings: &MongoSettings) -> Result<Option<NamedTempFile>> {
    let Some(body) = mongo_config_yaml(settings) else {
        return Ok(None);
    };
    let mut file = NamedTempFile::new()
        .map_err(|e| AppError::io("creating mongodump config file", e))?;
    file.write_all(body.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| AppError::io("writing mongodump config file", e))?;
    Ok(Some(file))
}

fn tool_name(program: &Path, fallback: &str) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Removes the partial artifact and passes the error through.
fn abandon(path: &Path, err: AppError) -> AppError {
    discard_partial(path);
    err
}

fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial dump {}: {}", path.display(), e);
        }
    }
}

/// Reads `reader` to the end, handing each chunk to the writer task.
/// Stops early without error if the writer has gone away; its own result carries the cause.
async fn pump<R>(reader: &mut R, tx: &mpsc::Sender<Vec<u8>>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        if tx.send(buf[..n].to_vec()).await.is_err() {
            return Ok(total);
        }
        total += n as u64;
    }
}

type DumpEncoder = GzEncoder<BufWriter<File>>;

/// Compresses chunks on a blocking thread until the sender is dropped.
fn spawn_encoder(
    mut encoder: DumpEncoder,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> JoinHandle<io::Result<DumpEncoder>> {
    task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            encoder.write_all(&chunk)?;
        }
        Ok(encoder)
    })
}

fn finalize(encoder: DumpEncoder) -> io::Result<()> {
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Runs `command`, gzip-compressing its stdout into a new file at `destination`.
///
/// Returns the number of uncompressed bytes written. On a non-zero exit the
/// partial file is removed and `AppError::DumpFailed` is returned.
pub async fn run_compressed_dump(command: &DumpCommand, destination: &Path) -> Result<u64> {
    let file = File::create(destination)
        .map_err(|e| AppError::io(format!("creating {}", destination.display()), e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    let mut child = command
        .to_command()
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|source| {
            abandon(
                destination,
                AppError::Spawn {
                    tool: command.tool.clone(),
                    source,
                },
            )
        })?;
    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return Err(abandon(
            destination,
            AppError::io(
                format!("capturing {} output", command.tool),
                io::Error::other("stdout was not piped"),
            ),
        ));
    };

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let writer = spawn_encoder(encoder, rx);
    let read_result = pump(&mut stdout, &tx).await;
    drop(tx);
    let write_result = writer.await.unwrap_or_else(|e| Err(io::Error::other(e)));

    let (written, encoder) = match (read_result, write_result) {
        (Ok(n), Ok(encoder)) => (n, encoder),
        (Err(e), _) => {
            let _ = child.kill().await;
            let err = AppError::io(format!("reading {} output", command.tool), e);
            return Err(abandon(destination, err));
        }
        (_, Err(e)) => {
            let _ = child.kill().await;
            let err = AppError::io(format!("writing {}", destination.display()), e);
            return Err(abandon(destination, err));
        }
    };

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            drop(encoder);
            let err = AppError::io(format!("waiting for {}", command.tool), e);
            return Err(abandon(destination, err));
        }
    };
    if !status.success() {
        drop(encoder);
        let err = AppError::DumpFailed {
            tool: command.tool.clone(),
            status,
        };
        return Err(abandon(destination, err));
    }

    task::spawn_blocking(move || finalize(encoder))
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
        .map_err(|source| AppError::Finalize {
            path: destination.to_path_buf(),
            source,
        })?;
    Ok(written)
}

/// Runs a tool that writes its own archive to `archive_path`.
pub async fn run_archive_dump(command: &DumpCommand, archive_path: &Path) -> Result<()> {
    let status = command
        .to_command()
        .stdout(Stdio::null())
        .status()
        .await
        .map_err(|source| AppError::Spawn {
            tool: command.tool.clone(),
            source,
        })?;
    if !status.success() {
        let err = AppError::DumpFailed {
            tool: command.tool.clone(),
            status,
        };
        return Err(abandon(archive_path, err));
    }
    Ok(())
}

/// Runs the real dump tools found on PATH.
pub struct ProcessDumper {
    mysql: EngineSettings,
    mysql_ssl_mode: Option<String>,
    postgres: EngineSettings,
    mongo: MongoSettings,
}

impl ProcessDumper {
    pub fn new(settings: &Settings) -> Self {
        ProcessDumper {
            mysql: settings.mysql.clone(),
            mysql_ssl_mode: settings.mysql_ssl_mode.clone(),
            postgres: settings.postgres.clone(),
            mongo: settings.mongo.clone(),
        }
    }
}

#[async_trait]
impl Dumper for ProcessDumper {
    async fn dump(&self, job: &BackupJob) -> Result<()> {
        match job.engine {
            Engine::MySql => {
                let program = find_executable(&["mysqldump", "mariadb-dump"])?;
                let command = mysql_command(program, &self.mysql, self.mysql_ssl_mode.as_deref());
                debug!(tool = %command.tool, args = ?command.args, "Running dump");
                let bytes = run_compressed_dump(&command, &job.destination).await?;
                info!("{} dump wrote {} bytes to {}", job.engine, bytes, job.destination.display());
            }
            Engine::Postgres => {
                let program = find_executable(&["pg_dumpall"])?;
                let command = postgres_command(program, &self.postgres);
                debug!(tool = %command.tool, args = ?command.args, "Running dump");
                let bytes = run_compressed_dump(&command, &job.destination).await?;
                info!("{} dump wrote {} bytes to {}", job.engine, bytes, job.destination.display());
            }
            Engine::Mongo => {
                let program = find_executable(&["mongodump"])?;
                let config = write_mongo_config(&self.mongo)?;
                let command = mongo_command(
                    program,
                    &self.mongo,
                    &job.destination,
                    config.as_ref().map(|f| f.path()),
                );
                match &self.mongo.uri {
                    Some(uri) => debug!(tool = %command.tool, uri = %redact_uri(uri), args = ?command.args, "Running dump"),
                    None => debug!(tool = %command.tool, args = ?command.args, "Running dump"),
                }
                run_archive_dump(&command, &job.destination).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn engine_settings(host: &str, port: &str, user: &str, password: &str) -> EngineSettings {
        EngineSettings {
            credential: Credential {
                host: host.to_string(),
                port: port.to_string(),
                user: user.to_string(),
            },
            password: Some(Password::new(password)),
        }
    }

    fn mongo_settings(uri: Option<&str>, password: Option<&str>) -> MongoSettings {
        MongoSettings {
            credential: Credential {
                host: "mongo".to_string(),
                port: "27017".to_string(),
                user: "backup".to_string(),
            },
            password: password.map(Password::new),
            uri: uri.map(str::to_string),
            auth_db: "admin".to_string(),
        }
    }

    fn shell(script: &str, env: Vec<(&'static str, Password)>) -> DumpCommand {
        DumpCommand {
            tool: "sh".to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env,
        }
    }

    fn gunzip(path: &Path) -> anyhow::Result<String> {
        let mut out = String::new();
        GzDecoder::new(File::open(path)?).read_to_string(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_mysql_command_arguments() {
        let settings = engine_settings("db1", "3306", "root", "secret");
        let cmd = mysql_command(PathBuf::from("/usr/bin/mysqldump"), &settings, Some("REQUIRED"));

        assert_eq!(cmd.tool, "mysqldump");
        assert_eq!(
            cmd.args,
            vec![
                "--all-databases",
                "--single-transaction",
                "--quick",
                "--routines",
                "--events",
                "--host=db1",
                "--port=3306",
                "--user=root",
                "--ssl-mode=REQUIRED",
            ]
        );
        assert_eq!(cmd.env, vec![("MYSQL_PWD", Password::new("secret"))]);
        assert!(cmd.args.iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn test_mysql_command_without_ssl_mode() {
        let settings = engine_settings("db1", "3307", "root", "secret");
        let cmd = mysql_command(PathBuf::from("mariadb-dump"), &settings, None);

        assert_eq!(cmd.tool, "mariadb-dump");
        assert!(cmd.args.iter().all(|a| !a.starts_with("--ssl-mode")));
        assert!(cmd.args.contains(&"--port=3307".to_string()));
    }

    #[test]
    fn test_mariadb_client_gets_its_own_tls_flags() {
        let settings = engine_settings("db1", "3306", "root", "secret");
        let cmd = mysql_command(PathBuf::from("mariadb-dump"), &settings, Some("REQUIRED"));

        assert!(cmd.args.iter().all(|a| !a.starts_with("--ssl-mode")));
        assert!(cmd.args.contains(&"--ssl".to_string()));
        assert!(!cmd.args.contains(&"--ssl-verify-server-cert".to_string()));

        let cmd = mysql_command(PathBuf::from("mariadb-dump"), &settings, Some("VERIFY_IDENTITY"));
        assert!(cmd.args.ends_with(&["--ssl".to_string(), "--ssl-verify-server-cert".to_string()]));

        let cmd = mysql_command(PathBuf::from("mariadb-dump"), &settings, Some("disabled"));
        assert!(cmd.args.ends_with(&["--skip-ssl".to_string()]));
    }

    #[cfg(unix)]
    #[test]
    fn test_mysqldump_linked_to_mariadb_is_detected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let real = dir.path().join("mariadb-dump");
        fs::write(&real, "")?;
        let link = dir.path().join("mysqldump");
        std::os::unix::fs::symlink(&real, &link)?;

        assert!(is_mariadb_client(&link));
        assert!(!is_mariadb_client(Path::new("/usr/bin/mysqldump-not-installed")));
        Ok(())
    }

    #[test]
    fn test_postgres_command_arguments() {
        let settings = engine_settings("pg", "5432", "postgres", "pw");
        let cmd = postgres_command(PathBuf::from("/usr/bin/pg_dumpall"), &settings);

        assert_eq!(
            cmd.args,
            vec!["--no-password", "-h", "pg", "-p", "5432", "-U", "postgres"]
        );
        assert_eq!(cmd.env, vec![("PGPASSWORD", Password::new("pw"))]);
    }

    #[test]
    fn test_mongo_command_explicit_mode_keeps_password_out_of_args() {
        let settings = mongo_settings(None, Some("topsecret"));
        let cmd = mongo_command(
            PathBuf::from("mongodump"),
            &settings,
            Path::new("/backups/mongo-2024-01-01.archive.gz"),
            Some(Path::new("/tmp/cfg.yaml")),
        );

        assert_eq!(
            cmd.args,
            vec![
                "--archive=/backups/mongo-2024-01-01.archive.gz",
                "--gzip",
                "--host=mongo",
                "--port=27017",
                "--username=backup",
                "--authenticationDatabase=admin",
                "--config=/tmp/cfg.yaml",
            ]
        );
        assert!(cmd.args.iter().all(|a| !a.contains("topsecret")));
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_mongo_command_uri_mode() {
        let settings = mongo_settings(Some("mongodb://u:p@mongo/"), None);
        let cmd = mongo_command(
            PathBuf::from("mongodump"),
            &settings,
            Path::new("out.archive.gz"),
            Some(Path::new("cfg.yaml")),
        );

        assert_eq!(cmd.args, vec!["--archive=out.archive.gz", "--gzip", "--config=cfg.yaml"]);
    }

    #[test]
    fn test_mongo_config_yaml_quotes_values() {
        let settings = mongo_settings(Some("mongodb://mongo/"), Some("it's"));
        assert_eq!(
            mongo_config_yaml(&settings).as_deref(),
            Some("uri: 'mongodb://mongo/'\npassword: 'it''s'\n")
        );

        let settings = mongo_settings(None, None);
        assert_eq!(mongo_config_yaml(&settings), None);
    }

    #[tokio::test]
    async fn test_compressed_dump_writes_gzip_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("mysql-2024-01-01.sql.gz");

        let written = run_compressed_dump(&shell("printf 'CREATE TABLE t;\\n'", vec![]), &dest).await?;

        assert_eq!(written, 16);
        assert_eq!(gunzip(&dest)?, "CREATE TABLE t;\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_password_is_injected_into_subprocess_env() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql.gz");
        let cmd = shell(
            "printf '%s' \"$MYSQL_PWD\"",
            vec![("MYSQL_PWD", Password::new("s3cr3t"))],
        );

        run_compressed_dump(&cmd, &dest).await?;

        assert_eq!(gunzip(&dest)?, "s3cr3t");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_removes_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql.gz");

        let result = run_compressed_dump(&shell("printf partial; exit 3", vec![]), &dest).await;

        match result {
            Err(AppError::DumpFailed { tool, status }) => {
                assert_eq!(tool, "sh");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected DumpFailed, got {:?}", other),
        }
        assert!(!dest.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_large_output_streams_through_encoder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("big.sql.gz");

        let written =
            run_compressed_dump(&shell("head -c 2000000 /dev/zero | tr '\\0' a", vec![]), &dest).await?;

        assert_eq!(written, 2_000_000);
        let out = gunzip(&dest)?;
        assert_eq!(out.len(), 2_000_000);
        assert!(out.bytes().all(|b| b == b'a'));
        Ok(())
    }

    #[test]
    fn test_abandon_removes_partial_and_keeps_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let partial = dir.path().join("out.sql.gz");
        fs::write(&partial, "half")?;

        let err = abandon(
            &partial,
            AppError::io("waiting for sh", io::Error::other("interrupted")),
        );

        assert!(matches!(err, AppError::Io { ref context, .. } if context == "waiting for sh"));
        assert!(!partial.exists());
        // Already gone is fine.
        let _ = abandon(&partial, AppError::Config("again".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql.gz");
        let cmd = DumpCommand {
            tool: "ghost".to_string(),
            program: dir.path().join("ghost-dump"),
            args: vec![],
            env: vec![],
        };

        let result = run_compressed_dump(&cmd, &dest).await;

        assert!(matches!(result, Err(AppError::Spawn { .. })));
        assert!(!dest.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_io_error() {
        let result = run_compressed_dump(
            &shell("printf x", vec![]),
            Path::new("/nonexistent-dir-for-dump/out.sql.gz"),
        )
        .await;
        assert!(matches!(result, Err(AppError::Io { .. })));
    }

    #[tokio::test]
    async fn test_archive_dump_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("mongo.archive.gz");
        let cmd = shell(&format!("printf junk > '{}'; exit 1", archive.display()), vec![]);

        let result = run_archive_dump(&cmd, &archive).await;

        assert!(matches!(result, Err(AppError::DumpFailed { .. })));
        assert!(!archive.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_dump_success_leaves_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("mongo.archive.gz");
        let cmd = shell(&format!("printf data > '{}'", archive.display()), vec![]);

        run_archive_dump(&cmd, &archive).await?;

        assert_eq!(fs::read_to_string(&archive)?, "data");
        Ok(())
    }
}
