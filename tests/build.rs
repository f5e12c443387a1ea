//! End-to-end build behavior.

use kiln::{
    error::{KilnError, Result},
    project_util::TempProject,
    Artifact, BuildProgram, Builder, Context, Declarations, SourceObject,
};
use pretty_assertions::assert_eq;
use std::{fs, time::SystemTime};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("kiln=trace").try_init();
}

fn read_artifact(project: &TempProject, name: &str) -> String {
    fs::read_to_string(project.artifact_path(name)).unwrap()
}

fn artifact_mtime(project: &TempProject, name: &str) -> SystemTime {
    fs::metadata(project.artifact_path(name)).unwrap().modified().unwrap()
}

fn simple_project() -> TempProject {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_content("", "title: Welcome\n_template: page.html\n");
    project.add_content("about", "title: About\n_template: page.html\n");
    project
}

#[test]
fn initial_build_produces_pages_with_their_sources() {
    init_tracing();
    let project = simple_project();
    project.build().unwrap();

    assert_eq!(read_artifact(&project, "index.html"), "<h1>Welcome</h1>\n");
    assert_eq!(read_artifact(&project, "about/index.html"), "<h1>About</h1>\n");

    let state = project.build_state().unwrap();
    let mut names = state.artifact_names();
    names.sort();
    assert_eq!(names, ["about/index.html", "index.html"]);

    let deps = state.iter_artifact_dependencies("about/index.html");
    let primary: Vec<_> =
        deps.iter().filter(|(s, _)| s == "content/about/contents.lr").collect();
    assert_eq!(primary.len(), 1);
    assert!(deps.iter().any(|(s, _)| s == "templates/page.html"));
}

#[test]
fn clean_builds_are_idempotent() {
    let project = simple_project();
    project.build().unwrap();

    let root_before = artifact_mtime(&project, "index.html");
    let about_before = artifact_mtime(&project, "about/index.html");

    project.build().unwrap();

    assert_eq!(artifact_mtime(&project, "index.html"), root_before);
    assert_eq!(artifact_mtime(&project, "about/index.html"), about_before);
    assert_eq!(read_artifact(&project, "index.html"), "<h1>Welcome</h1>\n");
}

#[test]
fn source_change_rebuilds_exactly_the_affected_artifact() {
    let project = simple_project();
    project.build().unwrap();
    let root_before = artifact_mtime(&project, "index.html");

    let about = project.root().join("content/about/contents.lr");
    project.modify(&about, "title: About v2\n_template: page.html\n");
    project.build().unwrap();

    assert_eq!(read_artifact(&project, "about/index.html"), "<h1>About v2</h1>\n");
    // the unrelated artifact was not rewritten
    assert_eq!(artifact_mtime(&project, "index.html"), root_before);
}

#[test]
fn template_change_invalidates_every_renderer() {
    let project = simple_project();
    project.build().unwrap();

    let template = project.root().join("templates/page.html");
    project.modify(&template, "<h2>{{ title }}</h2>");
    project.build().unwrap();

    assert_eq!(read_artifact(&project, "index.html"), "<h2>Welcome</h2>\n");
    assert_eq!(read_artifact(&project, "about/index.html"), "<h2>About</h2>\n");
}

#[test]
fn touch_without_content_change_rebuilds_nothing() {
    let project = simple_project();
    project.build().unwrap();
    let before = artifact_mtime(&project, "index.html");

    // mtime moves, the checksum does not
    project.touch(&project.root().join("content/contents.lr"));
    project.touch(&project.root().join("templates/page.html"));
    project.build().unwrap();

    assert_eq!(artifact_mtime(&project, "index.html"), before);
}

#[test]
fn unchanged_metadata_skips_the_content_read() {
    let project = simple_project();
    project.build().unwrap();

    // same length, same mtime: the fingerprint fast path must not notice
    let about = project.root().join("content/about/contents.lr");
    project.modify_preserving_mtime(&about, "title: AbouX\n_template: page.html\n");
    project.build().unwrap();

    assert_eq!(read_artifact(&project, "about/index.html"), "<h1>About</h1>\n");
}

#[test]
fn hidden_records_produce_no_artifacts() {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_content("", "title: Welcome\n");
    project.add_content("secret", "title: Secret\n_hidden: yes\n");
    project.build().unwrap();

    assert!(project.artifact_path("index.html").exists());
    assert!(!project.artifact_path("secret/index.html").exists());
}

#[test]
fn attachments_are_copied_byte_for_byte() {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_content("", "title: Welcome\n");
    project.add_content("about", "title: About\n");
    project.add_attachment("about", "photo.jpg", b"\xff\xd8jpeg bytes");
    project.build().unwrap();

    assert_eq!(
        fs::read(project.artifact_path("about/photo.jpg")).unwrap(),
        b"\xff\xd8jpeg bytes"
    );

    // the attachment's sidecar is part of the memorized sources
    let state = project.build_state().unwrap();
    let deps = state.iter_artifact_dependencies("about/photo.jpg");
    assert!(deps.iter().any(|(s, _)| s == "content/about/photo.jpg.lr"));
}

#[test]
fn assets_are_copied_into_the_output_tree() {
    let project = TempProject::new().unwrap();
    project.add_asset("static/app.js", "console.log('hi');");
    project.build().unwrap();

    assert_eq!(read_artifact(&project, "static/app.js"), "console.log('hi');");

    // asset change rebuilds the copy
    project.modify(&project.root().join("assets/static/app.js"), "console.log('v2');");
    project.build().unwrap();
    assert_eq!(read_artifact(&project, "static/app.js"), "console.log('v2');");
}

#[test]
fn special_sources_map_to_dotted_artifacts() {
    let project = TempProject::new().unwrap();
    project.add_asset("_htaccess", "Deny from all\n");
    project.build().unwrap();

    assert_eq!(read_artifact(&project, ".htaccess"), "Deny from all\n");
    // the dotted artifact is visible to the prune pass and survives it
    project.prune(false).unwrap();
    assert!(project.artifact_path(".htaccess").exists());
}

#[test]
fn pagination_produces_numbered_pages() {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_template(
        "projects.html",
        "<h1>{{ title }}</h1><p>page {{ page_num }}</p>",
    );
    project.add_content("", "title: Welcome\n");
    project.add_content("projects", "title: Projects\n_template: projects.html\n_per_page: 4\n");
    for n in 1..=7 {
        project.add_content(&format!("projects/p{n}"), &format!("title: Project {n}\n"));
    }
    project.build().unwrap();

    assert_eq!(
        read_artifact(&project, "projects/index.html"),
        "<h1>Projects</h1><p>page 1</p>\n"
    );
    assert_eq!(
        read_artifact(&project, "projects/page/2/index.html"),
        "<h1>Projects</h1><p>page 2</p>\n"
    );
    // 7 children over 4 per page: exactly two pages
    assert!(!project.artifact_path("projects/page/3/index.html").exists());
    assert!(project.artifact_path("projects/p7/index.html").exists());
}

#[derive(Debug)]
struct FailingProgram {
    url_path: String,
    sources: Vec<std::path::PathBuf>,
}

impl BuildProgram for FailingProgram {
    fn produce_artifacts(&self, _builder: &Builder<'_>, decls: &mut Declarations) -> Result<()> {
        decls.declare_artifact(self.url_path.clone(), self.sources.clone());
        Ok(())
    }

    fn build_artifact(
        &self,
        _builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        _ctx: &mut Context,
    ) -> Result<()> {
        // simulate a plugin crashing halfway through the write
        let mut f = artifact.open_write(true)?;
        use std::io::Write;
        f.write_all(b"partial garbage").unwrap();
        Err(KilnError::msg("simulated plugin failure"))
    }
}

fn register_failing_program(builder: &mut Builder<'_>) {
    builder.registry_mut().register(|source| match source {
        SourceObject::Record(record) if record.path == "/boom" => {
            Some(Box::new(FailingProgram {
                url_path: record.url_path.clone(),
                sources: record.iter_source_filenames(),
            }) as Box<dyn BuildProgram>)
        }
        _ => None,
    });
}

#[test]
fn failing_builds_leave_no_trace_and_flag_sources_dirty() {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_content("", "title: Welcome\n");
    project.add_content("boom", "title: Boom\n");

    let err = project.build_with(register_failing_program).unwrap_err();
    assert!(err.to_string().contains("simulated plugin failure"));

    // no artifact file, no rows, no staged leftovers
    assert!(!project.artifact_path("boom/index.html").exists());
    let state = project.build_state().unwrap();
    assert!(!state.artifact_names().contains(&"boom/index.html".to_string()));
    assert!(state.dirty_sources().contains("content/boom/contents.lr"));

    // once the bug is gone the build succeeds and clears the flag
    project.build().unwrap();
    assert!(project.artifact_path("boom/index.html").exists());
    let state = project.build_state().unwrap();
    assert!(state.dirty_sources().is_empty());
}

#[test]
fn failing_rebuilds_keep_the_previous_artifact() {
    let project = TempProject::new().unwrap();
    project.add_template("page.html", "<h1>{{ title }}</h1>");
    project.add_content("", "title: Welcome\n");
    project.add_content("boom", "title: Boom\n");
    project.build().unwrap();
    assert_eq!(read_artifact(&project, "boom/index.html"), "<h1>Boom</h1>\n");

    // make the source dirty so the failing program actually runs
    project.modify(
        &project.root().join("content/boom/contents.lr"),
        "title: Boom v2\n",
    );
    project.build_with(register_failing_program).unwrap_err();

    // the old artifact and its rows survive the failure
    assert_eq!(read_artifact(&project, "boom/index.html"), "<h1>Boom</h1>\n");
    let state = project.build_state().unwrap();
    assert!(state.artifact_names().contains(&"boom/index.html".to_string()));
    assert!(state.dirty_sources().contains("content/boom/contents.lr"));
}

#[test]
fn dirty_sources_force_rebuilds_with_unchanged_fingerprints() {
    let project = simple_project();
    project.build().unwrap();

    // flag the root page dirty by hand
    let state = project.build_state().unwrap();
    let artifact = state.new_artifact(
        "/",
        vec![project.root().join("content/contents.lr")],
        None,
    );
    state.mark_artifact_sources_dirty(&[artifact]).unwrap();
    let before = artifact_mtime(&project, "index.html");

    project.build().unwrap();

    // rebuilt despite identical fingerprints, flag cleared afterwards
    assert!(artifact_mtime(&project, "index.html") > before);
    let state = project.build_state().unwrap();
    assert!(state.dirty_sources().is_empty());
}

#[test]
fn interrupted_builds_are_swept_on_the_next_run() {
    let project = simple_project();
    project.build().unwrap();

    // fake a staged file left behind by a crash
    let stale = project.output_path().join(".__trans-leftover");
    fs::write(&stale, b"junk").unwrap();
    project.build().unwrap();

    assert!(!stale.exists());
}

#[test]
fn source_infos_are_written_and_pruned() {
    let project = simple_project();
    project.update_all_source_infos().unwrap();

    let state = project.build_state().unwrap();
    let info = state.get_source_info("/about", "_primary").expect("about info");
    assert_eq!(info.filename, "content/about/contents.lr");
    assert_eq!(info.title_i18n.get("en").map(String::as_str), Some("About"));
    assert!(state.get_source_info("/", "_primary").is_some());

    // deleting the record drops its info on the next pass
    fs::remove_dir_all(project.root().join("content/about")).unwrap();
    project.update_all_source_infos().unwrap();
    let state = project.build_state().unwrap();
    assert!(state.get_source_info("/about", "_primary").is_none());
    assert!(state.get_source_info("/", "_primary").is_some());
}
