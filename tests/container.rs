//! Root-only integration tests exercising a full launch: clone into fresh
//! namespaces, join a test cgroup, exec a shell, and wait for it to exit.
//! Each is marked `#[ignore]` with the privilege it needs, rather than
//! failing every CI run that isn't already running as root.

mod common;

use lxcore::{base_path, Conf, Container, Handler};

use common::{rand_string, TempCgroup, TempDir};

#[test]
#[ignore = "requires root to unshare namespaces"]
fn launch_runs_command_and_reports_exit_code() {
    let cgroup = TempCgroup::new().expect("temp cgroup");
    let conf = Conf::from_str("lxc.utsname = launchtest\n").unwrap();
    let command = vec!["/bin/sh".to_owned(), "-c".to_owned(), "exit 7".to_owned()];

    let mut handler =
        Handler::launch("launchtest", conf, &cgroup, &command, false).expect("launch");
    let code = handler.wait().expect("wait");
    assert_eq!(code, 7);
}

#[test]
#[ignore = "requires root to unshare namespaces"]
fn launch_shares_host_root_when_no_rootfs_configured() {
    let cgroup = TempCgroup::new().expect("temp cgroup");
    // No `lxc.rootfs`: the container keeps the host's root filesystem in
    // its own private mount namespace, so `/bin/sh` resolves normally.
    let conf = Conf::from_str("lxc.utsname = sharedroot\n").unwrap();
    let command = vec![
        "/bin/sh".to_owned(),
        "-c".to_owned(),
        "test -d /proc && exit 0 || exit 1".to_owned(),
    ];

    let mut handler =
        Handler::launch("sharedroot", conf, &cgroup, &command, false).expect("launch");
    let code = handler.wait().expect("wait");
    assert_eq!(code, 0);
}

#[test]
#[ignore = "requires root to unshare namespaces"]
fn container_create_open_and_launch_round_trip() {
    let tmp = TempDir::new().expect("temp dir");
    let base = tmp.join(format!("lxcpath-{}", rand_string(8)));
    std::fs::create_dir_all(&base).unwrap();

    let name = format!("roundtrip-{}", rand_string(8));
    let created = Container::create_with_text(&base, &name, "lxc.utsname = roundtrip\n")
        .expect("create container");
    let opened = Container::open(&base, &name).expect("open container");
    assert_eq!(created.path(), opened.path());

    opened.prepare_run_dir().expect("prepare run dir");
    let conf = opened.load_conf().expect("load conf");
    assert_eq!(conf.utsname.as_deref(), Some("roundtrip"));

    let cgroup = TempCgroup::new().expect("temp cgroup");
    let command = vec!["/bin/sh".to_owned(), "-c".to_owned(), "exit 0".to_owned()];
    let mut handler = Handler::launch(&name, conf, &cgroup, &command, false).expect("launch");
    assert_eq!(handler.wait().expect("wait"), 0);

    opened.teardown_run_dir().expect("teardown run dir");
}

#[test]
fn base_path_defaults_when_lxcpath_unset() {
    std::env::remove_var("LXCPATH");
    assert_eq!(base_path(), std::path::PathBuf::from("/var/lib/lxcore"));
}
