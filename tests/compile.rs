//! Integration tests for the back half of the pipeline: mount
//! compilation, seccomp synthesis, plan assembly and the launch lock.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use nestbox::error::{CompileError, InstanceError};
use nestbox::instance::{InstanceConfig, InstanceStore, LaunchLock};
use nestbox::sandbox::{
    compile_mounts, synthesize, CompileContext, LaunchPlan, MountEntry, HELPER_CHANNEL_FD,
    SANDBOX_HOME, SECCOMP_TARGET_FD,
};
use nestbox::service::{resolve, InstanceOverrides, ProfileRegistry, Service};

struct Fixture {
    _dir: TempDir,
    ctx: CompileContext,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("temp dir");
    let instance_home = dir.path().join("instance/home");
    let host_home = dir.path().join("home");
    fs::create_dir_all(&instance_home).expect("instance home");
    fs::create_dir_all(host_home.join("Downloads")).expect("downloads");
    fs::create_dir_all(host_home.join("Pictures")).expect("pictures");
    let ctx = CompileContext::new(instance_home, host_home, dir.path().join("run"));
    Fixture { _dir: dir, ctx }
}

fn web_browser_config() -> nestbox::ResolvedConfig {
    let dir = TempDir::new().expect("temp dir");
    fs::write(
        dir.path().join("web-browser.toml"),
        r#"
        [service.network]
        mode = "shared"

        [service.filesystem]
        grants = [{ path = "~/Downloads", mode = "read-write" }]
        "#,
    )
    .expect("profile");
    let registry = ProfileRegistry::load(&[dir.path().to_path_buf()]).expect("registry");
    let profile = registry.get("web-browser").expect("profile");

    let config = InstanceConfig::parse(
        Path::new("config.toml"),
        r#"
        profile = "web-browser"

        [service.filesystem]
        grants = [{ path = "~/Pictures", mode = "read-only" }]
        "#,
    )
    .expect("instance config");

    resolve(Some(profile), &config.overrides).expect("resolution")
}

#[test]
fn test_web_browser_mount_fragment() {
    let f = fixture();
    let cfg = web_browser_config();
    let fragment = compile_mounts(&cfg, &f.ctx).expect("compile");

    // Network is shared, so no net unshare; everything else isolated.
    assert!(!fragment.unshare.contains(&"--unshare-net".to_string()));
    assert!(fragment.unshare.contains(&"--unshare-pid".to_string()));

    // Downloads (profile) before Pictures (override), both under the
    // sandbox home.
    let args = fragment.to_args();
    let downloads = args
        .iter()
        .position(|a| a.ends_with("/Downloads"))
        .expect("downloads present");
    let pictures = args
        .iter()
        .position(|a| a.ends_with("/Pictures"))
        .expect("pictures present");
    assert!(downloads < pictures);

    let downloads_target = PathBuf::from(SANDBOX_HOME).join("Downloads");
    assert!(fragment.mounts.iter().any(
        |m| matches!(m, MountEntry::BindRw { target, .. } if target == &downloads_target)
    ));
}

#[test]
fn test_compile_and_synthesis_are_idempotent() {
    let f = fixture();
    let cfg = web_browser_config();

    let fragment_a = compile_mounts(&cfg, &f.ctx).expect("compile a");
    let fragment_b = compile_mounts(&cfg, &f.ctx).expect("compile b");
    assert_eq!(fragment_a.to_args(), fragment_b.to_args());

    let program_a = synthesize(&cfg).expect("synthesize a");
    let program_b = synthesize(&cfg).expect("synthesize b");
    assert_eq!(program_a.rules(), program_b.rules());
    assert_eq!(program_a.as_bytes(), program_b.as_bytes());
}

#[test]
fn test_network_composition_changes_seccomp() {
    let shared = web_browser_config();
    let isolated = resolve(
        None,
        &InstanceOverrides {
            services: vec![Service::Wayland(Default::default())],
            removed: Vec::new(),
        },
    )
    .expect("resolution");

    let shared_program = synthesize(&shared).expect("shared");
    let isolated_program = synthesize(&isolated).expect("isolated");

    assert!(shared_program.allows("listen"));
    assert!(!isolated_program.allows("listen"));
    assert_ne!(shared_program.as_bytes(), isolated_program.as_bytes());
}

#[test]
fn test_escape_outside_whitelist_fails_compilation() {
    let f = fixture();
    let cfg = resolve(
        None,
        &InstanceOverrides {
            services: vec![Service::Filesystem(nestbox::service::FilesystemOptions {
                grants: vec![nestbox::service::FilesystemGrant::read_only(
                    "/var/lib/machines",
                )],
            })],
            removed: Vec::new(),
        },
    )
    .expect("resolution");

    assert!(matches!(
        compile_mounts(&cfg, &f.ctx),
        Err(CompileError::PathEscape { .. })
    ));
}

#[test]
fn test_plan_assembly_references_fixed_descriptors() {
    let f = fixture();
    let cfg = web_browser_config();
    let fragment = compile_mounts(&cfg, &f.ctx).expect("compile");
    let program = synthesize(&cfg).expect("synthesize");

    let seccomp_fd = program.into_memfd().expect("memfd");
    let (_host, helper) = nestbox::helper::Channel::pair().expect("channel");

    let plan = LaunchPlan::assemble(
        fragment,
        seccomp_fd,
        helper.into_fd(),
        Path::new("/usr/lib/nestbox/nestbox-helper"),
        &["firefox".to_string()],
    );

    let args = plan.args();
    let seccomp_pos = args.iter().position(|a| a == "--seccomp").expect("seccomp");
    assert_eq!(args[seccomp_pos + 1], SECCOMP_TARGET_FD.to_string());
    let channel_pos = args
        .iter()
        .position(|a| a == "--channel-fd")
        .expect("channel fd");
    assert_eq!(args[channel_pos + 1], HELPER_CHANNEL_FD.to_string());
    assert_eq!(args.last(), Some(&"firefox".to_string()));

    // Two auxiliary descriptors, in plan order.
    assert_eq!(plan.aux_fds().len(), 2);
}

#[test]
fn test_launch_lock_contention() {
    let dir = TempDir::new().expect("temp dir");
    let store = InstanceStore::new(dir.path());
    let instance = store
        .create("locked", &InstanceConfig::default())
        .expect("create");

    let held = LaunchLock::acquire(&instance).expect("first acquire");

    // A second launch attempt must fail immediately without touching
    // the held lock.
    let result = LaunchLock::acquire(&instance);
    match result {
        Err(InstanceError::AlreadyRunning { name }) => assert_eq!(name, "locked"),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    // The original holder is unaffected.
    assert_eq!(held.metadata().pid, std::process::id());
    drop(held);

    let _reacquired = LaunchLock::acquire(&instance).expect("acquire after release");
}

#[test]
fn test_full_pipeline_from_documents() {
    // Everything short of spawning the primitive: store → resolver →
    // compilers → plan.
    let dir = TempDir::new().expect("temp dir");
    let store = InstanceStore::new(dir.path().join("instances"));

    let config = InstanceConfig::parse(
        Path::new("config.toml"),
        r#"
        [service.wayland]

        [service.filesystem]
        grants = [{ path = "~/Music", mode = "read-only" }]
        "#,
    )
    .expect("config");
    let instance = store.create("player", &config).expect("create");
    let _lock = LaunchLock::acquire(&instance).expect("lock");

    let host_home = dir.path().join("home");
    fs::create_dir_all(host_home.join("Music")).expect("music");
    let ctx = CompileContext::new(&instance.paths.home, &host_home, dir.path().join("run"));

    let cfg = resolve(None, &instance.config.overrides).expect("resolution");
    let fragment = compile_mounts(&cfg, &ctx).expect("compile");
    let program = synthesize(&cfg).expect("synthesize");

    assert!(fragment
        .env
        .iter()
        .any(|(k, v)| k == "WAYLAND_DISPLAY" && v == "wayland-0"));
    assert!(fragment.unshare.contains(&"--unshare-net".to_string()));
    assert!(!program.allows("listen"));

    let plan = LaunchPlan::assemble(
        fragment,
        program.into_memfd().expect("memfd"),
        nestbox::helper::Channel::pair().expect("channel").1.into_fd(),
        Path::new("/usr/lib/nestbox/nestbox-helper"),
        &["mpv".to_string(), "album.flac".to_string()],
    );
    assert!(plan.args().iter().any(|a| a == "--seccomp"));
}
