//! Unit tests for `rsync` transfers.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::ScriptedRunner;

#[derive(Clone, Debug)]
struct StaticAlias(Result<String, DiscoveryError>);

impl StaticAlias {
    fn named(alias: &str) -> Self {
        Self(Ok(alias.to_owned()))
    }
}

impl AliasSource for StaticAlias {
    fn resolve_alias(&self) -> Result<String, DiscoveryError> {
        self.0.clone()
    }
}

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    Workspace { _dir: dir, root }
}

fn transfer(runner: &ScriptedRunner) -> Transfer<ScriptedRunner, StaticAlias> {
    let config = TransferConfig {
        rsync_bin: "rsync".to_owned(),
        ssh_dir: "~/.ssh".to_owned(),
    };
    Transfer::new(config, runner.clone(), StaticAlias::named("vast-ai-dev"))
        .expect("valid transfer config")
}

fn only_command(runner: &ScriptedRunner) -> String {
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1, "expected one rsync call");
    invocations
        .first()
        .map(|invocation| invocation.command_string())
        .unwrap_or_default()
}

#[rstest]
#[case("/workspace/", "vast-ai-dev:/workspace/model.pt")]
#[case("/workspace/renamed.pt", "vast-ai-dev:/workspace/renamed.pt")]
fn upload_file_appends_basename_for_directory_targets(
    workspace: Workspace,
    #[case] remote: &str,
    #[case] expected_remote: &str,
) {
    let local = workspace.root.join("model.pt");
    std::fs::write(&local, b"weights").expect("write local file");
    let runner = ScriptedRunner::new();
    runner.push_success();

    transfer(&runner)
        .upload_file(&local, remote)
        .expect("upload succeeds");

    assert_eq!(
        only_command(&runner),
        format!("rsync -avz --progress {local} {expected_remote}")
    );
}

#[rstest]
fn upload_file_rejects_missing_source(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let local = workspace.root.join("absent.txt");

    let err = transfer(&runner)
        .upload_file(&local, "/workspace/")
        .expect_err("missing file rejected");

    assert_eq!(err, TransferError::MissingLocalPath { path: local });
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn upload_file_rejects_directories(workspace: Workspace) {
    let runner = ScriptedRunner::new();

    let err = transfer(&runner)
        .upload_file(&workspace.root, "/workspace/")
        .expect_err("directory rejected");

    assert_eq!(
        err,
        TransferError::NotAFile {
            path: workspace.root.clone()
        }
    );
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn upload_folder_copies_contents_into_remote_directory(workspace: Workspace) {
    let local = workspace.root.join("data");
    std::fs::create_dir(&local).expect("create data dir");
    let runner = ScriptedRunner::new();
    runner.push_success();

    transfer(&runner)
        .upload_folder(&local, "/workspace/data")
        .expect("folder upload succeeds");

    assert_eq!(
        only_command(&runner),
        format!("rsync -avz --progress {local}/ vast-ai-dev:/workspace/data/")
    );
}

#[rstest]
fn upload_folder_rejects_files(workspace: Workspace) {
    let local = workspace.root.join("notes.txt");
    std::fs::write(&local, b"notes").expect("write file");
    let runner = ScriptedRunner::new();

    let err = transfer(&runner)
        .upload_folder(&local, "/workspace/")
        .expect_err("file rejected");

    assert_eq!(err, TransferError::NotADirectory { path: local });
}

#[rstest]
fn download_file_creates_missing_parent(workspace: Workspace) {
    let local = workspace.root.join("out/nested/result.json");
    let runner = ScriptedRunner::new();
    runner.push_success();

    transfer(&runner)
        .download_file("/workspace/result.json", &local)
        .expect("download succeeds");

    assert!(workspace.root.join("out/nested").is_dir());
    assert_eq!(
        only_command(&runner),
        format!("rsync -avz --progress vast-ai-dev:/workspace/result.json {local}")
    );
}

#[rstest]
fn download_folder_creates_destination_and_normalises_slashes(workspace: Workspace) {
    let local = workspace.root.join("checkpoints");
    let runner = ScriptedRunner::new();
    runner.push_success();

    transfer(&runner)
        .download_folder("/workspace/checkpoints//", &local)
        .expect("folder download succeeds");

    assert!(local.is_dir());
    assert_eq!(
        only_command(&runner),
        format!("rsync -avz --progress vast-ai-dev:/workspace/checkpoints/ {local}/")
    );
}

#[rstest]
fn non_zero_exit_reports_stderr(workspace: Workspace) {
    let local = workspace.root.join("model.pt");
    std::fs::write(&local, b"weights").expect("write local file");
    let runner = ScriptedRunner::new();
    runner.push_failure(23, "rsync: some files could not be transferred");

    let err = transfer(&runner)
        .upload_file(&local, "/workspace/")
        .expect_err("rsync failure surfaces");

    assert_eq!(
        err,
        TransferError::CommandFailure {
            program: "rsync".to_owned(),
            status: Some(23),
            status_text: "23".to_owned(),
            stderr: "rsync: some files could not be transferred".to_owned(),
        }
    );
}

#[rstest]
fn spawn_failure_is_returned_unchanged(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let spawn = ShellError::Spawn {
        program: "rsync".to_owned(),
        message: "No such file or directory".to_owned(),
    };
    runner.push_error(spawn.clone());

    let err = transfer(&runner)
        .download_folder("/workspace/", &workspace.root)
        .expect_err("spawn failure surfaces");

    assert_eq!(err, TransferError::Shell(spawn));
}

#[rstest]
fn alias_failure_stops_before_rsync(workspace: Workspace) {
    let runner = ScriptedRunner::new();
    let config = TransferConfig {
        rsync_bin: "rsync".to_owned(),
        ssh_dir: "~/.ssh".to_owned(),
    };
    let aliases = StaticAlias(Err(DiscoveryError::SelectionCancelled));
    let helper = Transfer::new(config, runner.clone(), aliases).expect("valid config");

    let err = helper
        .download_file("/workspace/a.txt", &workspace.root.join("a.txt"))
        .expect_err("cancelled selection surfaces");

    assert_eq!(err, TransferError::Discovery(DiscoveryError::SelectionCancelled));
    assert!(runner.invocations().is_empty());
}

#[test]
fn blank_rsync_binary_is_rejected() {
    let config = TransferConfig {
        rsync_bin: "  ".to_owned(),
        ssh_dir: "~/.ssh".to_owned(),
    };

    let err = Transfer::new(config, ScriptedRunner::new(), StaticAlias::named("host"))
        .expect_err("blank binary rejected");

    assert_eq!(
        err,
        TransferConfigError::InvalidConfig {
            field: "rsync_bin".to_owned()
        }
    );
}

#[test]
fn ssh_config_path_points_at_config_file() {
    let config = TransferConfig {
        rsync_bin: "rsync".to_owned(),
        ssh_dir: "/tmp/ssh-home".to_owned(),
    };

    assert_eq!(
        config.ssh_config_path(),
        Utf8PathBuf::from("/tmp/ssh-home/config")
    );
}
