use super::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use rigger_core::{
    Dotfile, EffectiveSpecification, Hooks, Repository, Script, ScriptWhen, Specification,
};
use rigger_snapshot::SnapshotManager;
use rigger_state::{ChangeAction, SpecLock, StateLayout, StateManager, STATUS_FAILED};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "rigger-engine-{label}-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("must create test dir");
    fs::canonicalize(&dir).expect("must canonicalize test dir")
}

struct Fixture {
    root: PathBuf,
    config: PathBuf,
    home: PathBuf,
    store: StateManager,
}

impl Fixture {
    fn new(label: &str) -> Self {
        let root = test_root(label);
        let config = root.join("config");
        let home = root.join("home");
        fs::create_dir_all(&config).expect("must create config dir");
        fs::create_dir_all(&home).expect("must create home dir");
        let store = StateManager::new(StateLayout::new(root.join("state")));
        Self {
            root,
            config,
            home,
            store,
        }
    }

    fn write_source(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.join(name);
        fs::write(&path, content).expect("must write source");
        path
    }

    fn target(&self, name: &str) -> PathBuf {
        self.home.join(name)
    }

    fn dotfile(&self, source: &str, target: &str) -> Dotfile {
        Dotfile {
            source: source.to_string(),
            target: path_str(&self.target(target)),
        }
    }

    fn effective(&self, spec: Specification) -> EffectiveSpecification {
        EffectiveSpecification::new(spec, &self.config)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn named_spec(name: &str) -> Specification {
    Specification {
        name: name.to_string(),
        ..Specification::default()
    }
}

#[derive(Clone, Default)]
struct FakeInstaller {
    installed: Arc<Mutex<BTreeSet<String>>>,
    failing: BTreeSet<String>,
}

impl PackageInstaller for FakeInstaller {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_installed(&self, package: &str) -> bool {
        self.installed
            .lock()
            .expect("installed lock")
            .contains(package)
    }

    fn install(&self, package: &str) -> Result<()> {
        if self.failing.contains(package) {
            bail!("package '{package}' is not available");
        }
        self.installed
            .lock()
            .expect("installed lock")
            .insert(package.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeRunner {
    calls: Arc<Mutex<Vec<String>>>,
    failing: Option<String>,
    exploding: Option<String>,
    panicking: Option<String>,
    cancel_on: Option<(String, CancelToken)>,
}

impl FakeRunner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &str, _cwd: &Path) -> Result<CommandOutput> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(command.to_string());
        if let Some((trigger, token)) = &self.cancel_on {
            if trigger == command {
                token.cancel();
            }
        }
        if self.panicking.as_deref() == Some(command) {
            panic!("runner state corrupted while running {command}");
        }
        if self.exploding.as_deref() == Some(command) {
            return Err(anyhow!("runner lost its output pipe"));
        }
        if self.failing.as_deref() == Some(command) {
            return Ok(CommandOutput::failed(2, "boom"));
        }
        Ok(CommandOutput::succeeded(format!("ran {command}")))
    }
}

#[derive(Clone, Default)]
struct FakeGit {
    heads: Arc<Mutex<BTreeMap<PathBuf, String>>>,
    pushes: Arc<Mutex<Vec<PathBuf>>>,
    advance_on_pull: bool,
    failing_pull: bool,
    dirty: bool,
}

impl GitClient for FakeGit {
    fn clone_repo(&self, url: &str, _branch: &str, destination: &Path) -> Result<()> {
        if url.contains("unreachable") {
            bail!("could not resolve host");
        }
        fs::create_dir_all(destination.join(".git"))?;
        self.heads
            .lock()
            .expect("heads lock")
            .insert(destination.to_path_buf(), "1111111111111111".to_string());
        Ok(())
    }

    fn pull(&self, repo_root: &Path) -> Result<()> {
        if self.failing_pull {
            bail!("remote rejected fetch");
        }
        if self.advance_on_pull {
            self.heads
                .lock()
                .expect("heads lock")
                .insert(repo_root.to_path_buf(), "2222222222222222".to_string());
        }
        Ok(())
    }

    fn head(&self, repo_root: &Path) -> Result<String> {
        self.heads
            .lock()
            .expect("heads lock")
            .get(repo_root)
            .cloned()
            .ok_or_else(|| anyhow!("no HEAD for {}", repo_root.display()))
    }

    fn push(&self, repo_root: &Path) -> Result<()> {
        self.pushes
            .lock()
            .expect("pushes lock")
            .push(repo_root.to_path_buf());
        Ok(())
    }

    fn status_porcelain(&self, _repo_root: &Path) -> Result<String> {
        Ok(if self.dirty {
            " M README.md\n".to_string()
        } else {
            String::new()
        })
    }
}

fn capabilities(installer: &FakeInstaller, git: &FakeGit, runner: &FakeRunner) -> Capabilities {
    Capabilities {
        installer: Box::new(installer.clone()),
        git: Box::new(git.clone()),
        renderer: Box::new(MiniJinjaRenderer),
        runner: Box::new(runner.clone()),
        template_extension: DEFAULT_TEMPLATE_EXTENSION.to_string(),
    }
}

fn apply(
    fixture: &Fixture,
    effective: &EffectiveSpecification,
    caps: &Capabilities,
    run: RunOptions,
) -> Result<ApplyReport, ApplyError> {
    Reconciler::new(effective, &fixture.store, caps).apply(&ApplyOptions {
        run,
        cancel: CancelToken::new(),
    })
}

fn records_of(report: &ApplyReport, action: ChangeAction) -> Vec<&rigger_state::ChangeRecord> {
    report
        .records
        .iter()
        .filter(|record| record.action == action)
        .collect()
}

#[cfg(unix)]
#[test]
fn full_apply_converges_and_second_apply_changes_nothing() {
    let fixture = Fixture::new("idempotent");
    fixture.write_source("vimrc", "set number\n");
    fixture.write_source("gitconfig.j2", "[core]\n  editor = {{ editor }}\n");

    let mut spec = named_spec("workstation");
    spec.variables
        .insert("editor".to_string(), serde_yaml::Value::from("vim"));
    spec.system.packages = vec!["git".to_string()];
    spec.git.repositories = vec![Repository {
        url: "https://example.com/dots.git".to_string(),
        path: path_str(&fixture.home.join("src/dots")),
        branch: "main".to_string(),
    }];
    spec.dotfiles = vec![
        fixture.dotfile("vimrc", ".vimrc"),
        fixture.dotfile("gitconfig.j2", ".gitconfig"),
    ];
    spec.scripts = vec![Script::new("echo done")];
    let effective = fixture.effective(spec);

    let installer = FakeInstaller::default();
    let git = FakeGit::default();
    let runner = FakeRunner::default();
    let caps = capabilities(&installer, &git, &runner);

    let first = apply(&fixture, &effective, &caps, RunOptions::default()).expect("first apply");
    assert_eq!(first.failures(), 0);
    assert_eq!(first.records_with(ChangeAction::InstalledPackage), 1);
    assert_eq!(first.records_with(ChangeAction::GitCloned), 1);
    assert_eq!(first.records_with(ChangeAction::CreatedSymlink), 1);
    assert_eq!(first.records_with(ChangeAction::RenderedFromTemplate), 1);
    assert_eq!(first.records_with(ChangeAction::ExecutedScript), 1);
    assert_eq!(
        fs::read_link(fixture.target(".vimrc")).expect("vimrc must be a link"),
        fixture.config.join("vimrc")
    );
    assert_eq!(
        fs::read_to_string(fixture.target(".gitconfig")).expect("rendered gitconfig"),
        "[core]\n  editor = vim\n"
    );
    assert!(first.rollback_point.as_ref().is_some_and(|path| path.exists()));
    assert!(fixture
        .store
        .read_transient_state("workstation")
        .expect("read marker")
        .is_none());

    let second = apply(&fixture, &effective, &caps, RunOptions::default()).expect("second apply");
    assert_eq!(second.records_with(ChangeAction::CreatedSymlink), 0);
    assert_eq!(second.records_with(ChangeAction::RenderedFromTemplate), 0);
    assert_eq!(second.records_with(ChangeAction::GitCloned), 0);
    assert_eq!(second.records_with(ChangeAction::InstalledPackage), 0);
    assert_eq!(second.records_with(ChangeAction::BackupFile), 0);
    let dotfile_stage = second
        .stages
        .iter()
        .find(|stage| stage.stage == Stage::LinkDotfiles)
        .expect("dotfile stage must be reported");
    assert!(dotfile_stage
        .outcomes
        .iter()
        .all(|outcome| outcome.status == ItemStatus::Skipped));
}

#[cfg(unix)]
#[test]
fn existing_target_is_moved_aside_and_restored_by_rollback() {
    let fixture = Fixture::new("backup");
    fixture.write_source("a", "from config\n");
    fs::write(fixture.target(".a"), "original\n").expect("must seed target");

    let mut spec = named_spec("backup-box");
    spec.dotfiles = vec![fixture.dotfile("a", ".a")];
    let effective = fixture.effective(spec);
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    let backups = records_of(&report, ChangeAction::BackupFile);
    assert_eq!(backups.len(), 1);
    let backup_path = PathBuf::from(
        backups[0]
            .detail_str("backup_path")
            .expect("backup record names its backup"),
    );
    let backup_name = backup_path
        .file_name()
        .expect("backup file name")
        .to_string_lossy()
        .into_owned();
    assert!(backup_name.starts_with(".a."));
    assert!(backup_name.ends_with(".bak"));
    assert_eq!(
        fs::read_to_string(&backup_path).expect("backup content"),
        "original\n"
    );
    assert!(fs::symlink_metadata(fixture.target(".a"))
        .expect("target")
        .file_type()
        .is_symlink());

    let undo = rollback_latest(&fixture.store, "backup-box", APPLY_OPERATION)
        .expect("rollback")
        .expect("a rollback point must exist");
    assert_eq!(undo.undone(), 2);
    let restored = fs::symlink_metadata(fixture.target(".a")).expect("restored target");
    assert!(restored.file_type().is_file());
    assert_eq!(
        fs::read_to_string(fixture.target(".a")).expect("restored content"),
        "original\n"
    );
    assert!(!backup_path.exists());
}

#[cfg(unix)]
#[test]
fn unexpected_fault_rolls_back_the_run() {
    let fixture = Fixture::new("abort");
    fixture.write_source("one", "1\n");
    fixture.write_source("two", "2\n");

    let mut spec = named_spec("abort-box");
    spec.dotfiles = vec![fixture.dotfile("one", ".one"), fixture.dotfile("two", ".two")];
    spec.scripts = vec![Script::new("echo explode")];
    let effective = fixture.effective(spec);
    let runner = FakeRunner {
        exploding: Some("echo explode".to_string()),
        ..FakeRunner::default()
    };
    let caps = capabilities(&FakeInstaller::default(), &FakeGit::default(), &runner);

    let err = apply(&fixture, &effective, &caps, RunOptions::default())
        .expect_err("apply must abort");
    match err {
        ApplyError::Aborted { stage, undo, cause } => {
            assert_eq!(stage, Stage::RunScripts);
            assert_eq!(undo.undone(), 2);
            assert!(format!("{cause:#}").contains("output pipe"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fs::symlink_metadata(fixture.target(".one")).is_err());
    assert!(fs::symlink_metadata(fixture.target(".two")).is_err());
    assert!(fixture
        .store
        .read_transient_state("abort-box")
        .expect("read marker")
        .is_none());
    assert!(fixture
        .store
        .list("abort-box", APPLY_OPERATION)
        .expect("list")
        .is_empty());
}

#[cfg(unix)]
#[test]
fn panic_inside_a_stage_rolls_back_and_clears_the_marker() {
    let fixture = Fixture::new("panic");
    fixture.write_source("one", "1\n");

    let mut spec = named_spec("panic-box");
    spec.dotfiles = vec![fixture.dotfile("one", ".one")];
    spec.scripts = vec![Script::new("echo crash")];
    let effective = fixture.effective(spec);
    let runner = FakeRunner {
        panicking: Some("echo crash".to_string()),
        ..FakeRunner::default()
    };
    let caps = capabilities(&FakeInstaller::default(), &FakeGit::default(), &runner);

    let err = apply(&fixture, &effective, &caps, RunOptions::default())
        .expect_err("apply must abort");
    match err {
        ApplyError::Aborted { stage, undo, cause } => {
            assert_eq!(stage, Stage::RunScripts);
            assert_eq!(undo.undone(), 1);
            assert!(format!("{cause:#}").contains("runner state corrupted"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fs::symlink_metadata(fixture.target(".one")).is_err());
    assert!(fixture
        .store
        .read_transient_state("panic-box")
        .expect("read marker")
        .is_none());
    SpecLock::acquire(fixture.store.layout(), "panic-box").expect("lock must be released");
}

#[test]
fn restricted_and_traversal_targets_are_refused_without_mutation() {
    let fixture = Fixture::new("restricted");
    fixture.write_source("hosts", "127.0.0.1 box\n");

    let mut spec = named_spec("guarded");
    spec.dotfiles = vec![
        Dotfile {
            source: "hosts".to_string(),
            target: "/etc/rigger-test-hosts".to_string(),
        },
        Dotfile {
            source: "hosts".to_string(),
            target: format!("{}/../escape", path_str(&fixture.home)),
        },
    ];
    let effective = fixture.effective(spec);
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    let refused = records_of(&report, ChangeAction::SecurityError);
    assert_eq!(refused.len(), 2);
    assert_eq!(
        refused[0].detail_str("error"),
        Some("restricted_path:/etc")
    );
    assert_eq!(refused[1].detail_str("error"), Some("path_traversal"));
    assert_eq!(report.failures(), 2);
    assert_eq!(report.records_with(ChangeAction::CreatedSymlink), 0);
    assert!(fs::symlink_metadata("/etc/rigger-test-hosts").is_err());
    assert!(fs::symlink_metadata(fixture.root.join("escape")).is_err());
}

#[test]
fn source_outside_the_configuration_directory_is_refused() {
    let fixture = Fixture::new("outside");
    let stray = fixture.root.join("stray");
    fs::write(&stray, "stray\n").expect("must write stray file");

    let mut spec = named_spec("outside");
    spec.dotfiles = vec![
        Dotfile {
            source: path_str(&stray),
            target: path_str(&fixture.target(".stray")),
        },
        Dotfile {
            source: "../stray".to_string(),
            target: path_str(&fixture.target(".stray2")),
        },
    ];
    let effective = fixture.effective(spec);
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    let refused = records_of(&report, ChangeAction::SecurityError);
    assert_eq!(refused.len(), 2);
    assert!(refused
        .iter()
        .all(|record| record.detail_str("error") == Some("source_outside_config")));
    assert!(fs::symlink_metadata(fixture.target(".stray")).is_err());
}

#[test]
fn dry_run_records_intentions_and_touches_nothing() {
    let fixture = Fixture::new("dry-run");
    fixture.write_source("zshrc", "export EDITOR=vim\n");
    fs::write(fixture.target(".zshrc"), "old\n").expect("must seed target");

    let mut spec = named_spec("dry");
    spec.system.packages = vec!["ripgrep".to_string()];
    spec.git.repositories = vec![Repository {
        url: "https://example.com/notes.git".to_string(),
        path: path_str(&fixture.home.join("notes")),
        branch: "main".to_string(),
    }];
    spec.dotfiles = vec![fixture.dotfile("zshrc", ".zshrc")];
    spec.scripts = vec![Script::new("echo hi")];
    let effective = fixture.effective(spec);

    let installer = FakeInstaller::default();
    let runner = FakeRunner::default();
    let caps = capabilities(&installer, &FakeGit::default(), &runner);
    let run = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    let report = apply(&fixture, &effective, &caps, run).expect("dry run");
    assert!(report.dry_run);
    for action in [
        ChangeAction::WouldInstallPackage,
        ChangeAction::WouldCloneRepo,
        ChangeAction::WouldBackupFile,
        ChangeAction::WouldCreateSymlink,
        ChangeAction::WouldExecuteScript,
    ] {
        assert_eq!(report.records_with(action), 1, "expected one {action}");
    }
    assert!(report.records.iter().all(|record| !record.action.is_mutation()));
    assert!(report.rollback_point.is_none());
    assert!(runner.calls().is_empty());
    assert!(!installer.is_installed("ripgrep"));
    assert_eq!(
        fs::read_to_string(fixture.target(".zshrc")).expect("target untouched"),
        "old\n"
    );
    assert!(!fixture.home.join("notes").exists());
    assert!(!fixture
        .store
        .layout()
        .transient_state_path("dry")
        .exists());
}

#[cfg(unix)]
#[test]
fn force_deletes_existing_target_instead_of_backing_up() {
    let fixture = Fixture::new("force");
    fixture.write_source("tmux.conf", "set -g mouse on\n");
    fs::write(fixture.target(".tmux.conf"), "stale\n").expect("must seed target");

    let mut spec = named_spec("forced");
    spec.dotfiles = vec![fixture.dotfile("tmux.conf", ".tmux.conf")];
    let effective = fixture.effective(spec);
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );
    let run = RunOptions {
        force: true,
        ..RunOptions::default()
    };

    let report = apply(&fixture, &effective, &caps, run).expect("apply");
    assert_eq!(report.records_with(ChangeAction::DeletedFile), 1);
    assert_eq!(report.records_with(ChangeAction::BackupFile), 0);
    assert_eq!(report.records_with(ChangeAction::CreatedSymlink), 1);
    let leftovers: Vec<_> = fs::read_dir(&fixture.home)
        .expect("read home")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
        .collect();
    assert!(leftovers.is_empty());
}

#[cfg(unix)]
#[test]
fn missing_source_is_recorded_and_later_dotfiles_still_apply() {
    let fixture = Fixture::new("missing-source");
    fixture.write_source("present", "here\n");

    let mut spec = named_spec("partial");
    spec.dotfiles = vec![
        fixture.dotfile("absent", ".absent"),
        fixture.dotfile("absent.j2", ".absent-rendered"),
        fixture.dotfile("present", ".present"),
    ];
    let effective = fixture.effective(spec);
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    assert_eq!(report.records_with(ChangeAction::FailedSymlink), 1);
    assert_eq!(report.records_with(ChangeAction::FailedRender), 1);
    assert_eq!(report.records_with(ChangeAction::CreatedSymlink), 1);
    assert_eq!(report.failures(), 2);
    assert!(fixture.target(".present").exists());
}

#[test]
fn unsafe_scripts_are_refused_and_passes_run_in_order() {
    let fixture = Fixture::new("scripts");
    let mut pre = Script::new("echo pre");
    pre.when = ScriptWhen::Pre;
    let mut both = Script::new("echo both");
    both.when = ScriptWhen::Both;
    let post = Script::new("echo post");
    let unsafe_script = Script::new("echo hi && rm -rf /");

    let runner = FakeRunner::default();
    let service = ScriptService::new(&runner, &fixture.config);
    let mut tracker = rigger_state::OperationTracker::new("scripts", APPLY_OPERATION);
    let outcomes = service
        .run_scripts(
            &[post, pre, both, unsafe_script],
            Some(&mut tracker),
            &RunOptions::default(),
            &NoProgress,
        )
        .expect("scripts must run");

    assert_eq!(
        runner.calls(),
        vec!["echo pre", "echo both", "echo post", "echo both"]
    );
    assert_eq!(outcomes.len(), 5);
    let refused: Vec<_> = tracker
        .changes()
        .iter()
        .filter(|record| record.action == ChangeAction::SecurityError)
        .collect();
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].path, "echo hi && rm -rf /");
    assert!(outcomes.iter().any(|outcome| outcome.is_failed()));
}

#[test]
fn failed_script_is_recorded_and_apply_carries_on() {
    let fixture = Fixture::new("script-failure");
    let mut spec = named_spec("scripted");
    spec.scripts = vec![Script::new("make broken"), Script::new("echo after")];
    let effective = fixture.effective(spec);
    let runner = FakeRunner {
        failing: Some("make broken".to_string()),
        ..FakeRunner::default()
    };
    let caps = capabilities(&FakeInstaller::default(), &FakeGit::default(), &runner);

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    let executed = records_of(&report, ChangeAction::ExecutedScript);
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].status(), Some(STATUS_FAILED));
    assert_eq!(executed[0].detail_str("error"), Some("exited with status 2"));
    assert_eq!(executed[0].detail_str("stderr"), Some("boom"));
    assert_eq!(executed[1].status(), Some("success"));
    assert_eq!(report.failures(), 1);
}

#[cfg(unix)]
#[test]
fn hooks_run_at_their_stage_and_are_tagged() {
    let fixture = Fixture::new("hooks");
    fixture.write_source("profile", "export A=1\n");
    let mut spec = named_spec("hooked");
    spec.dotfiles = vec![fixture.dotfile("profile", ".profile")];
    spec.hooks = Hooks {
        pre_dotfiles: vec![Script::new("echo before-dotfiles")],
        post_scripts: vec![Script::new("echo finished")],
        ..Hooks::default()
    };
    let effective = fixture.effective(spec);
    let runner = FakeRunner::default();
    let caps = capabilities(&FakeInstaller::default(), &FakeGit::default(), &runner);

    let report = apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");
    assert_eq!(runner.calls(), vec!["echo before-dotfiles", "echo finished"]);
    let actions: Vec<_> = report.records.iter().map(|record| record.action).collect();
    assert_eq!(
        actions,
        vec![
            ChangeAction::ExecutedScript,
            ChangeAction::CreatedSymlink,
            ChangeAction::ExecutedScript
        ]
    );
    assert_eq!(report.records[0].detail_str("hook"), Some("pre_dotfiles"));
    assert_eq!(report.records[2].detail_str("hook"), Some("post_scripts"));
}

#[test]
fn package_failures_are_recorded_and_remaining_packages_install() {
    let installer = FakeInstaller {
        failing: ["missing-pkg".to_string()].into_iter().collect(),
        ..FakeInstaller::default()
    };
    installer
        .installed
        .lock()
        .expect("installed lock")
        .insert("git".to_string());

    let mut tracker = rigger_state::OperationTracker::new("pkgs", APPLY_OPERATION);
    let outcomes = PackageService::new(&installer)
        .reconcile(
            &[
                "git".to_string(),
                "missing-pkg".to_string(),
                "jq".to_string(),
            ],
            Some(&mut tracker),
            &RunOptions::default(),
            &NoProgress,
        )
        .expect("packages");

    let statuses: Vec<_> = outcomes.iter().map(|outcome| outcome.status).collect();
    assert_eq!(
        statuses,
        vec![ItemStatus::Skipped, ItemStatus::Failed, ItemStatus::Applied]
    );
    assert_eq!(tracker.len(), 2);
    assert_eq!(tracker.changes()[0].status(), Some(STATUS_FAILED));
    assert!(installer.is_installed("jq"));
}

#[test]
fn repositories_clone_then_pull_and_keep_input_order() {
    let fixture = Fixture::new("repos");
    fs::create_dir_all(fixture.home.join("plain")).expect("must create plain dir");
    let repos = vec![
        Repository {
            url: "https://example.com/a.git".to_string(),
            path: path_str(&fixture.home.join("a")),
            branch: "main".to_string(),
        },
        Repository {
            url: "https://example.com/b.git".to_string(),
            path: path_str(&fixture.home.join("b")),
            branch: "dev".to_string(),
        },
        Repository {
            url: "https://unreachable.invalid/c.git".to_string(),
            path: path_str(&fixture.home.join("c")),
            branch: "main".to_string(),
        },
        Repository {
            url: "https://example.com/plain.git".to_string(),
            path: path_str(&fixture.home.join("plain")),
            branch: "main".to_string(),
        },
    ];

    let git = FakeGit::default();
    let mut tracker = rigger_state::OperationTracker::new("repos", APPLY_OPERATION);
    let outcomes = RepositoryService::new(&git)
        .reconcile(&repos, Some(&mut tracker), &RunOptions::default(), &NoProgress)
        .expect("repositories");
    let statuses: Vec<_> = outcomes.iter().map(|outcome| outcome.status).collect();
    assert_eq!(
        statuses,
        vec![
            ItemStatus::Applied,
            ItemStatus::Applied,
            ItemStatus::Failed,
            ItemStatus::Skipped
        ]
    );
    let cloned: Vec<_> = tracker
        .changes()
        .iter()
        .map(|record| (record.action, record.detail_str("url").map(str::to_string)))
        .collect();
    assert_eq!(
        cloned,
        vec![
            (
                ChangeAction::GitCloned,
                Some("https://example.com/a.git".to_string())
            ),
            (
                ChangeAction::GitCloned,
                Some("https://example.com/b.git".to_string())
            ),
            (
                ChangeAction::GitCloned,
                Some("https://unreachable.invalid/c.git".to_string())
            ),
        ]
    );
    let failed_clone = &tracker.changes()[2];
    assert!(failed_clone.is_failed());
    assert!(failed_clone
        .detail_str("error")
        .expect("failed clone must carry its error")
        .contains("could not resolve host"));
    assert!(tracker.changes()[..2].iter().all(|record| !record.is_failed()));

    let mut unchanged = rigger_state::OperationTracker::new("repos", APPLY_OPERATION);
    let outcomes = RepositoryService::new(&git)
        .reconcile(&repos[..2], Some(&mut unchanged), &RunOptions::default(), &NoProgress)
        .expect("pull");
    assert!(outcomes.iter().all(|outcome| outcome.detail == "already up to date"));
    assert!(unchanged.is_empty());

    let advancing = FakeGit {
        advance_on_pull: true,
        ..git.clone()
    };
    let mut updated = rigger_state::OperationTracker::new("repos", APPLY_OPERATION);
    RepositoryService::new(&advancing)
        .reconcile(&repos[..1], Some(&mut updated), &RunOptions::default(), &NoProgress)
        .expect("pull");
    assert_eq!(updated.len(), 1);
    let record = &updated.changes()[0];
    assert_eq!(record.action, ChangeAction::UpdatedRepo);
    assert_eq!(record.detail_str("previous_head"), Some("1111111111111111"));
    assert_eq!(record.detail_str("current_head"), Some("2222222222222222"));
}

#[test]
fn failed_pull_is_journaled_with_failure_status_and_not_replayed() {
    let fixture = Fixture::new("pull-fail");
    let checkout = fixture.home.join("dots");
    fs::create_dir_all(checkout.join(".git")).expect("must create checkout");
    let repos = vec![Repository {
        url: "https://example.com/dots.git".to_string(),
        path: path_str(&checkout),
        branch: "main".to_string(),
    }];
    let git = FakeGit {
        failing_pull: true,
        ..FakeGit::default()
    };

    let mut tracker = rigger_state::OperationTracker::new("repos", APPLY_OPERATION);
    let outcomes = RepositoryService::new(&git)
        .reconcile(&repos, Some(&mut tracker), &RunOptions::default(), &NoProgress)
        .expect("repositories");
    assert!(outcomes[0].is_failed());
    assert_eq!(tracker.len(), 1);
    let record = &tracker.changes()[0];
    assert_eq!(record.action, ChangeAction::UpdatedRepo);
    assert_eq!(record.status(), Some(STATUS_FAILED));
    assert!(record
        .detail_str("error")
        .expect("failed pull must carry its error")
        .contains("remote rejected fetch"));

    let undo = rigger_state::replay_records(tracker.changes());
    assert!(undo.is_empty());
    assert!(checkout.join(".git").is_dir());
}

#[test]
fn restricted_repository_path_is_refused() {
    let git = FakeGit::default();
    let repos = vec![Repository {
        url: "https://example.com/evil.git".to_string(),
        path: "/usr/bin/evil".to_string(),
        branch: "main".to_string(),
    }];
    let mut tracker = rigger_state::OperationTracker::new("repos", APPLY_OPERATION);
    let outcomes = RepositoryService::new(&git)
        .reconcile(&repos, Some(&mut tracker), &RunOptions::default(), &NoProgress)
        .expect("repositories");
    assert!(outcomes[0].is_failed());
    assert_eq!(tracker.changes()[0].action, ChangeAction::SecurityError);
    assert!(git.heads.lock().expect("heads lock").is_empty());
}

#[test]
fn cancellation_before_the_first_stage_aborts_cleanly() {
    let fixture = Fixture::new("cancel");
    let effective = fixture.effective(named_spec("cancelled"));
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = Reconciler::new(&effective, &fixture.store, &caps)
        .apply(&ApplyOptions {
            run: RunOptions::default(),
            cancel,
        })
        .expect_err("cancelled apply must fail");
    match err {
        ApplyError::Aborted { stage, undo, .. } => {
            assert_eq!(stage, Stage::PreSystem);
            assert!(undo.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture
        .store
        .read_transient_state("cancelled")
        .expect("read marker")
        .is_none());
}

#[cfg(unix)]
#[test]
fn cancellation_mid_run_stops_at_the_next_stage_and_undoes_work() {
    let fixture = Fixture::new("cancel-mid");
    fixture.write_source("one", "1\n");
    let mut spec = named_spec("cancel-mid");
    spec.dotfiles = vec![fixture.dotfile("one", ".one")];
    spec.hooks = Hooks {
        post_dotfiles: vec![Script::new("echo stop-here")],
        post_scripts: vec![Script::new("echo never")],
        ..Hooks::default()
    };
    spec.scripts = vec![Script::new("echo skipped")];
    let effective = fixture.effective(spec);
    let cancel = CancelToken::new();
    let runner = FakeRunner {
        cancel_on: Some(("echo stop-here".to_string(), cancel.clone())),
        ..FakeRunner::default()
    };
    let caps = capabilities(&FakeInstaller::default(), &FakeGit::default(), &runner);

    let err = Reconciler::new(&effective, &fixture.store, &caps)
        .apply(&ApplyOptions {
            run: RunOptions::default(),
            cancel,
        })
        .expect_err("cancelled apply must fail");
    match err {
        ApplyError::Aborted { stage, undo, .. } => {
            assert_eq!(stage, Stage::PreScripts);
            assert_eq!(undo.undone(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.calls(), vec!["echo stop-here"]);
    assert!(fs::symlink_metadata(fixture.target(".one")).is_err());
    assert!(fixture
        .store
        .read_transient_state("cancel-mid")
        .expect("read marker")
        .is_none());
}

#[test]
fn apply_refuses_to_run_while_another_process_holds_the_lock() {
    let fixture = Fixture::new("locked");
    let effective = fixture.effective(named_spec("locked"));
    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );
    let _held = SpecLock::acquire(fixture.store.layout(), "locked").expect("lock");

    let err = apply(&fixture, &effective, &caps, RunOptions::default())
        .expect_err("apply must not run concurrently");
    assert!(matches!(err, ApplyError::Setup(_)));
    assert!(err.to_string().contains("locked by process"));
}

#[cfg(unix)]
#[test]
fn clean_removes_only_links_owned_by_the_specification() {
    let fixture = Fixture::new("clean");
    let ours = fixture.write_source("bashrc", "alias ll='ls -l'\n");
    fixture.write_source("inputrc", "set bell-style none\n");
    fixture.write_source("dangling", "gone soon\n");
    let elsewhere = fixture.root.join("elsewhere");
    fs::write(&elsewhere, "not ours\n").expect("must write elsewhere");

    std::os::unix::fs::symlink(&ours, fixture.target(".bashrc")).expect("link ours");
    std::os::unix::fs::symlink(&elsewhere, fixture.target(".inputrc")).expect("link elsewhere");
    std::os::unix::fs::symlink(fixture.root.join("vanished"), fixture.target(".dangling"))
        .expect("link dangling");
    fs::write(fixture.target(".plain"), "regular\n").expect("write plain");
    fixture.write_source("plain", "plain\n");

    let mut spec = named_spec("cleaner");
    spec.dotfiles = vec![
        fixture.dotfile("bashrc", ".bashrc"),
        fixture.dotfile("inputrc", ".inputrc"),
        fixture.dotfile("dangling", ".dangling"),
        fixture.dotfile("plain", ".plain"),
        fixture.dotfile("never-linked", ".never"),
    ];
    let effective = fixture.effective(spec);

    let outcomes = clean(&effective, &RunOptions::default(), &NoProgress).expect("clean");
    let statuses: Vec<_> = outcomes.iter().map(|outcome| outcome.status).collect();
    assert_eq!(
        statuses,
        vec![
            ItemStatus::Applied,
            ItemStatus::Skipped,
            ItemStatus::Applied,
            ItemStatus::Skipped,
            ItemStatus::Skipped
        ]
    );
    assert!(fs::symlink_metadata(fixture.target(".bashrc")).is_err());
    assert!(fs::symlink_metadata(fixture.target(".dangling")).is_err());
    assert!(fs::symlink_metadata(fixture.target(".inputrc"))
        .expect("foreign link stays")
        .file_type()
        .is_symlink());
    assert!(fixture.target(".plain").is_file());
}

#[cfg(unix)]
#[test]
fn status_reports_missing_then_converged_state() {
    let fixture = Fixture::new("status");
    fixture.write_source("vimrc", "syntax on\n");
    fixture.write_source("env.j2", "NAME={{ name }}\n");

    let mut spec = named_spec("status-box");
    spec.variables
        .insert("name".to_string(), serde_yaml::Value::from("ada"));
    spec.dotfiles = vec![
        fixture.dotfile("vimrc", ".vimrc"),
        fixture.dotfile("env.j2", ".env"),
    ];
    spec.git.repositories = vec![Repository {
        url: "https://example.com/r.git".to_string(),
        path: path_str(&fixture.home.join("r")),
        branch: "main".to_string(),
    }];
    let effective = fixture.effective(spec);
    let snapshots = SnapshotManager::new(fixture.root.join("backups"));
    let renderer = MiniJinjaRenderer;
    let service = DotfileService::new(&renderer, &fixture.config, &effective.spec.variables);

    let before = collect_status(&effective, &service, &fixture.store, &snapshots)
        .expect("status before apply");
    assert!(before
        .dotfiles
        .iter()
        .all(|status| status.state == DotfileState::Missing));
    assert_eq!(before.repositories[0].state, RepositoryState::Missing);
    assert!(before.latest_rollback_point.is_none());
    assert!(!before.is_converged());

    let caps = capabilities(
        &FakeInstaller::default(),
        &FakeGit::default(),
        &FakeRunner::default(),
    );
    apply(&fixture, &effective, &caps, RunOptions::default()).expect("apply");

    let after = collect_status(&effective, &service, &fixture.store, &snapshots)
        .expect("status after apply");
    assert_eq!(after.dotfiles[0].state, DotfileState::Linked);
    assert_eq!(after.dotfiles[1].state, DotfileState::Rendered);
    assert_eq!(after.repositories[0].state, RepositoryState::Present);
    assert!(after.latest_rollback_point.is_some());
    assert!(after.latest_snapshot.is_none());
    assert!(after.is_converged());
}

#[test]
fn diff_reports_new_and_changed_targets() {
    let fixture = Fixture::new("diff");
    fixture.write_source("gitignore", "target/\n*.log\n");
    fixture.write_source("fresh", "new\n");
    fs::write(fixture.target(".gitignore"), "target/\n").expect("seed target");

    let dotfiles = vec![
        fixture.dotfile("gitignore", ".gitignore"),
        fixture.dotfile("fresh", ".fresh"),
    ];
    let variables = BTreeMap::new();
    let renderer = MiniJinjaRenderer;
    let service = DotfileService::new(&renderer, &fixture.config, &variables);

    let diffs = diff_dotfiles(&service, &dotfiles);
    assert_eq!(diffs[0].kind, DiffKind::Changed);
    let patch = diffs[0].patch.as_deref().expect("text targets carry a patch");
    assert!(patch.contains("+*.log"));
    assert_eq!(diffs[1].kind, DiffKind::New);
    assert!(diffs[1].patch.is_none());
}

struct FailingPlugin;

impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    fn apply(&self, _effective: &EffectiveSpecification, _options: &RunOptions) -> Result<bool> {
        bail!("plugin exploded")
    }
}

#[test]
fn plugin_registry_runs_named_or_all_plugins() {
    let fixture = Fixture::new("plugins");
    let effective = fixture.effective(named_spec("plugged"));
    let mut registry = PluginRegistry::with_builtins();
    registry
        .register(Box::new(FailingPlugin))
        .expect("register failing plugin");
    assert_eq!(registry.names(), vec!["inventory", "failing"]);
    assert!(registry.register(Box::new(InventoryPlugin)).is_err());

    let all = registry
        .run(&[], &effective, &RunOptions::default())
        .expect("run all");
    assert_eq!(all.len(), 2);
    assert!(all[0].success);
    assert!(!all[1].success);
    assert_eq!(all[1].error.as_deref(), Some("plugin exploded"));

    let named = registry
        .run(&["inventory".to_string()], &effective, &RunOptions::default())
        .expect("run named");
    assert_eq!(named.len(), 1);

    let err = registry
        .run(&["nope".to_string()], &effective, &RunOptions::default())
        .expect_err("unknown plugin must fail");
    assert!(err.to_string().contains("'nope' not found"));
}

#[test]
fn inventory_summary_counts_sections() {
    let fixture = Fixture::new("inventory");
    let mut spec = named_spec("counted");
    spec.system.packages = vec!["git".to_string(), "curl".to_string()];
    spec.scripts = vec![Script::new("echo one")];
    let effective = fixture.effective(spec);
    assert_eq!(
        InventoryPlugin::summary(&effective),
        "counted: 2 packages, 0 repositories, 0 dotfiles, 1 scripts, 0 hooks"
    );
}

#[test]
fn sync_pushes_checkouts_even_when_dirty() {
    let fixture = Fixture::new("sync");
    fs::create_dir_all(fixture.home.join("dots/.git")).expect("checkout");
    fs::create_dir_all(fixture.home.join("loose")).expect("plain dir");
    let repos = vec![
        Repository {
            url: "https://example.com/dots.git".to_string(),
            path: path_str(&fixture.home.join("dots")),
            branch: "main".to_string(),
        },
        Repository {
            url: "https://example.com/loose.git".to_string(),
            path: path_str(&fixture.home.join("loose")),
            branch: "main".to_string(),
        },
        Repository {
            url: "https://example.com/absent.git".to_string(),
            path: path_str(&fixture.home.join("absent")),
            branch: "main".to_string(),
        },
    ];
    let git = FakeGit {
        dirty: true,
        ..FakeGit::default()
    };

    let outcomes =
        sync_repositories(&git, &repos, &RunOptions::default(), &NoProgress).expect("sync");
    let statuses: Vec<_> = outcomes.iter().map(|outcome| outcome.status).collect();
    assert_eq!(
        statuses,
        vec![ItemStatus::Applied, ItemStatus::Skipped, ItemStatus::Skipped]
    );
    assert_eq!(
        *git.pushes.lock().expect("pushes lock"),
        vec![fixture.home.join("dots")]
    );

    let dry = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let quiet = FakeGit::default();
    sync_repositories(&quiet, &repos, &dry, &NoProgress).expect("dry sync");
    assert!(quiet.pushes.lock().expect("pushes lock").is_empty());
}

#[test]
fn debouncer_enforces_minimum_interval() {
    let mut debouncer = Debouncer::new(Duration::from_secs(1));
    let start = Instant::now();
    assert!(debouncer.should_run(start));
    assert!(!debouncer.should_run(start + Duration::from_millis(300)));
    assert!(debouncer.should_run(start + Duration::from_millis(1200)));
    assert!(!debouncer.should_run(start + Duration::from_millis(1500)));
}

#[test]
fn watch_events_are_filtered_to_specification_documents() {
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use notify::{Event, EventKind};

    let watched = vec![PathBuf::from("/home/alice/rig/rigger.yaml")];
    let modified = Event::new(EventKind::Modify(ModifyKind::Any))
        .add_path(PathBuf::from("/home/alice/rig/rigger.yaml"));
    let created = Event::new(EventKind::Create(CreateKind::File))
        .add_path(PathBuf::from("/home/alice/rig/rigger.yaml"));
    let unrelated = Event::new(EventKind::Modify(ModifyKind::Any))
        .add_path(PathBuf::from("/home/alice/rig/notes.txt"));
    let removed = Event::new(EventKind::Remove(RemoveKind::File))
        .add_path(PathBuf::from("/home/alice/rig/rigger.yaml"));

    assert!(is_relevant(&modified, &watched));
    assert!(is_relevant(&created, &watched));
    assert!(!is_relevant(&unrelated, &watched));
    assert!(!is_relevant(&removed, &watched));
}

fn git_run(repo_root: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .expect("git must launch");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_commit_all(repo_root: &Path, message: &str) {
    git_run(repo_root, &["add", "-A"]);
    git_run(
        repo_root,
        &[
            "-c",
            "user.name=Rigger Tests",
            "-c",
            "user.email=rigger-tests@example.com",
            "commit",
            "-m",
            message,
        ],
    );
}

#[test]
fn system_git_clones_and_pulls_a_local_fixture() {
    if which::which("git").is_err() {
        return;
    }
    let fixture = Fixture::new("system-git");
    let upstream = fixture.root.join("upstream");
    fs::create_dir_all(&upstream).expect("upstream dir");
    git_run(&upstream, &["init"]);
    git_run(&upstream, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    fs::write(upstream.join("README.md"), "one\n").expect("write readme");
    git_commit_all(&upstream, "first");

    let repos = vec![Repository {
        url: path_str(&upstream),
        path: path_str(&fixture.home.join("checkout")),
        branch: "main".to_string(),
    }];
    let git = SystemGit;
    let mut cloned = rigger_state::OperationTracker::new("git", APPLY_OPERATION);
    RepositoryService::new(&git)
        .reconcile(&repos, Some(&mut cloned), &RunOptions::default(), &NoProgress)
        .expect("clone");
    assert_eq!(cloned.changes()[0].action, ChangeAction::GitCloned);
    assert!(fixture.home.join("checkout/README.md").is_file());

    fs::write(upstream.join("README.md"), "two\n").expect("update readme");
    git_commit_all(&upstream, "second");

    let mut pulled = rigger_state::OperationTracker::new("git", APPLY_OPERATION);
    RepositoryService::new(&git)
        .reconcile(&repos, Some(&mut pulled), &RunOptions::default(), &NoProgress)
        .expect("pull");
    assert_eq!(pulled.changes()[0].action, ChangeAction::UpdatedRepo);
    assert_ne!(
        pulled.changes()[0].detail_str("previous_head"),
        pulled.changes()[0].detail_str("current_head")
    );
    assert_eq!(
        fs::read_to_string(fixture.home.join("checkout/README.md")).expect("pulled readme"),
        "two\n"
    );
}
