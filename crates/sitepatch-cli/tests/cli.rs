use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture_app() -> PathBuf {
    workspace_root().join("fixtures/site/app")
}

fn copy_pages(app: &Path, slugs: &[&str]) {
    for slug in slugs {
        let dest = app.join(slug).join("page.tsx");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::copy(fixture_app().join(slug).join("page.tsx"), &dest).unwrap();
    }
}

#[allow(deprecated)]
fn sitepatch() -> Command {
    let mut cmd = Command::cargo_bin("sitepatch").expect("binary");
    for var in [
        "SITEPATCH_WORKSPACE_ROOT",
        "SITEPATCH_TARGET_DIR",
        "SITEPATCH_REPORTS_DIR",
        "SITEPATCH_DRY_RUN",
        "SITEPATCH_EXTENSIONS",
        "SITEPATCH_PAGE_STEMS",
    ] {
        cmd.env_remove(var);
    }
    cmd.arg("--workspace-root").arg(workspace_root());
    cmd
}

#[allow(deprecated)]
fn sitepatch_subcommand(name: &str) -> Command {
    let mut cmd = Command::cargo_bin("sitepatch").expect("binary");
    cmd.env_remove("SITEPATCH_WORKSPACE_ROOT")
        .env_remove("SITEPATCH_REPORTS_DIR")
        .arg(name)
        .arg("--workspace-root")
        .arg(workspace_root());
    cmd
}

#[test]
fn dry_run_previews_changes_without_writing() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    copy_pages(&app, &["commercial/historic-restoration"]);
    let page = app.join("commercial/historic-restoration/page.tsx");
    let before = fs::read(&page).unwrap();

    let output = sitepatch()
        .arg("--feature=hub-faqs")
        .arg("--dry-run")
        .arg("--target-dir")
        .arg(&app)
        .output()
        .expect("command run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("hub-faqs (dry run): 1 updated"), "{stdout}");
    assert!(stdout.contains("would update"));
    assert!(stdout.contains("faq section"));
    assert_eq!(fs::read(&page).unwrap(), before);
}

#[test]
fn second_run_changes_nothing() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    copy_pages(
        &app,
        &["commercial/historic-restoration", "residential/kitchen-remodeling"],
    );

    let first = sitepatch()
        .arg("--feature=hub-faqs")
        .arg("--target-dir")
        .arg(&app)
        .output()
        .expect("command run");
    assert!(first.status.success());
    let patched = fs::read_to_string(app.join("commercial/historic-restoration/page.tsx")).unwrap();
    assert!(patched.contains("<FAQSchema faqs={faqs} />"));

    let second = sitepatch()
        .arg("--feature=hub-faqs")
        .arg("--target-dir")
        .arg(&app)
        .output()
        .expect("command run");
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(second.status.success());
    assert!(stdout.contains("0 updated, 2 already present"), "{stdout}");
    assert_eq!(
        fs::read_to_string(app.join("commercial/historic-restoration/page.tsx")).unwrap(),
        patched
    );
}

#[test]
fn failed_pages_set_the_exit_code_and_reports_are_persisted() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    let reports = temp.path().join("reports");
    copy_pages(
        &app,
        &[
            "commercial/historic-restoration",
            "commercial/storm-hardening",
            "locations/tampa",
            "locations/orlando",
        ],
    );

    let output = sitepatch()
        .arg("--target-dir")
        .arg(&app)
        .arg("--reports-dir")
        .arg(&reports)
        .output()
        .expect("command run");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("[anchor_not_found]"));
    assert!(stdout.contains("storm-hardening"));
    assert!(stdout.contains("[no_anchor]"));
    assert!(stdout.contains("internal-links: 1 updated"));
    assert_eq!(fs::read_dir(&reports).unwrap().count(), 3);

    let listing = sitepatch_subcommand("report")
        .arg("--reports-dir")
        .arg(&reports)
        .arg("--runs")
        .arg("2")
        .output()
        .expect("command run");
    let listing = String::from_utf8_lossy(&listing.stdout);
    assert_eq!(listing.matches("## Run `").count(), 2);
}

#[test]
fn unwritable_reports_dir_still_patches_every_feature() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    let reports = temp.path().join("reports");
    fs::write(&reports, "").unwrap();
    copy_pages(
        &app,
        &["commercial/historic-restoration", "blog/hurricane-season-checklist"],
    );

    let output = sitepatch()
        .arg("--target-dir")
        .arg(&app)
        .arg("--reports-dir")
        .arg(&reports)
        .output()
        .expect("command run");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success(), "stdout: {stdout}");
    assert_eq!(stdout.matches("report not written").count(), 3, "{stdout}");
    assert!(stdout.contains("related-articles: 1 updated"), "{stdout}");
    let page = fs::read_to_string(app.join("blog/hurricane-season-checklist/page.tsx")).unwrap();
    assert!(page.contains("relatedArticles"));
}

#[test]
fn run_subcommand_accepts_the_same_flags() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    copy_pages(&app, &["blog/hurricane-season-checklist"]);

    let output = sitepatch_subcommand("run")
        .arg("--feature")
        .arg("related-articles")
        .arg("--target-dir")
        .arg(&app)
        .output()
        .expect("command run");
    assert!(output.status.success());
    let page = fs::read_to_string(app.join("blog/hurricane-season-checklist/page.tsx")).unwrap();
    assert!(page.starts_with("\"use client\";\n\nimport Link from \"next/link\";\n"));
    assert!(page.contains("title: \"Impact Windows vs. Storm Shutters\","));
}

#[test]
fn unknown_feature_is_rejected_before_touching_pages() {
    let temp = tempdir().unwrap();
    let app = temp.path().join("app");
    copy_pages(&app, &["commercial/historic-restoration"]);

    let output = sitepatch()
        .arg("--feature=newsletter")
        .arg("--target-dir")
        .arg(&app)
        .output()
        .expect("command run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown feature `newsletter`"));
}

#[test]
fn classify_and_features_read_workspace_config() {
    let output = sitepatch_subcommand("classify")
        .arg("commercial/historic-restoration")
        .arg("about")
        .output()
        .expect("command run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("commercial/historic-restoration\thistoric"));
    assert!(stdout.contains("about\tgeneral"));

    let output = sitepatch_subcommand("features").output().expect("command run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hub-faqs\tmarker=FAQSchema"));
    assert!(stdout.contains("internal-links"));
}
