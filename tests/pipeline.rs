//! End-to-end tests: source directory → item tree → pipeline → exported files.

use batcher::batcher::{BatchError, BatchOptions, Batcher};
use batcher::builtins::{MatchMode, OverwriteMode, export_dict, matching_text_dict, rename_dict};
use batcher::commands::{CommandGroup, load_pipeline, save_pipeline};
use batcher::config::{self, BatchConfig, ConfigOverrides, NameFilter};
use batcher::itemtree::ItemTree;
use batcher::pdb::{InMemoryProcedureDatabase, ProcedureDatabase};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use walkdir::WalkDir;

// ============================================================================
// Helpers
// ============================================================================

/// Create files (content = relative path) under a new temp directory.
fn source(files: &[&str]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for file in files {
        let path = tmp.path().join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, file).unwrap();
    }
    tmp
}

/// Relative paths of all files under `root`, sorted, with `/` separators.
fn files_in(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    files.sort();
    files
}

fn batcher_for(src: &Path, out: &Path, is_preview: bool) -> Batcher {
    Batcher::new(
        ItemTree::from_dir(src).unwrap(),
        BatchOptions {
            output_dir: out.to_path_buf(),
            is_preview,
            ..BatchOptions::default()
        },
    )
}

fn run_config(src: &Path, out: &Path, config: &BatchConfig) -> batcher::batcher::BatchReport {
    let (actions, conditions) = config::build_pipeline(config, src).unwrap();
    batcher_for(src, out, false).run(&actions, &conditions).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn default_config_exports_every_file_with_its_folders() {
    let src = source(&["Body/Hands/Left.png", "Body/Torso.png", "cover.png"]);
    let out = TempDir::new().unwrap();

    let report = run_config(src.path(), out.path(), &BatchConfig::default());

    assert_eq!(
        files_in(out.path()),
        vec!["Body/Hands/Left.png", "Body/Torso.png", "cover.png"]
    );
    assert_eq!(report.written_count(), 3);
    assert_eq!(
        fs::read_to_string(out.path().join("Body/Torso.png")).unwrap(),
        "Body/Torso.png"
    );
}

#[test]
fn numbered_pattern_restarts_per_folder() {
    let src = source(&["a/x.png", "a/y.png", "b/z.png"]);
    let out = TempDir::new().unwrap();
    let mut config = BatchConfig::default();
    config.rename.pattern = "image[001]".to_string();

    run_config(src.path(), out.path(), &config);

    assert_eq!(
        files_in(out.path()),
        vec!["a/image001.png", "a/image002.png", "b/image001.png"]
    );
}

#[test]
fn conditions_from_config_filter_files() {
    let src = source(&["keep.png", "skip.jpg", "draft-keep.png"]);
    let out = TempDir::new().unwrap();
    let mut config = BatchConfig::default();
    config.conditions.matching_file_extension = true;
    config.conditions.name_filter = Some(NameFilter {
        text: "DRAFT".to_string(),
        match_mode: MatchMode::DoesNotStartWith,
        ignore_case: true,
    });

    let report = run_config(src.path(), out.path(), &config);

    assert_eq!(files_in(out.path()), vec!["keep.png"]);
    assert_eq!(report.files().count(), 1);
}

#[test]
fn preview_writes_nothing_but_plans_outputs() {
    let src = source(&["Body/Left.png"]);
    let out = TempDir::new().unwrap();
    let (actions, conditions) = config::build_pipeline(
        &BatchConfig {
            rename: config::RenameConfig {
                pattern: "[image path, _]".to_string(),
                ..config::RenameConfig::default()
            },
            ..BatchConfig::default()
        },
        src.path(),
    )
    .unwrap();

    let report = batcher_for(src.path(), out.path(), true)
        .run(&actions, &conditions)
        .unwrap();

    assert!(files_in(out.path()).is_empty());
    let left = report.files().next().unwrap();
    assert_eq!(left.name, "Body_Left");
    assert_eq!(left.source, PathBuf::from("Body").join("Left.png"));
    assert_eq!(left.output_path, Some(out.path().join("Body").join("Body_Left.png")));
    assert!(!left.written);
}

#[test]
fn overwrite_modes_on_second_run() {
    let src = source(&["a.png"]);
    let out = TempDir::new().unwrap();
    fs::write(out.path().join("a.png"), "old").unwrap();

    let run_with = |mode: OverwriteMode| {
        let actions = CommandGroup::create(
            "actions",
            vec![rename_dict("[image name]", true, false), export_dict("png", mode)],
        )
        .unwrap();
        let conditions = CommandGroup::create("conditions", vec![]).unwrap();
        batcher_for(src.path(), out.path(), false)
            .run(&actions, &conditions)
            .unwrap()
    };

    let report = run_with(OverwriteMode::Skip);
    assert_eq!(report.written_count(), 0);
    assert_eq!(fs::read_to_string(out.path().join("a.png")).unwrap(), "old");

    run_with(OverwriteMode::RenameNew);
    assert_eq!(files_in(out.path()), vec!["a (1).png", "a.png"]);

    run_with(OverwriteMode::Replace);
    assert_eq!(fs::read_to_string(out.path().join("a.png")).unwrap(), "a.png");
}

#[test]
fn saved_pipeline_round_trips_through_a_run() {
    let src = source(&["one.png", "two.png"]);
    let out = TempDir::new().unwrap();
    let pipeline = src.path().join("pipeline.json");

    let actions = CommandGroup::create(
        "actions",
        vec![rename_dict("img[1, %n]", true, false), export_dict("png", OverwriteMode::Replace)],
    )
    .unwrap();
    let conditions = CommandGroup::create(
        "conditions",
        vec![matching_text_dict(MatchMode::EndsWith, ".png", false)],
    )
    .unwrap();
    save_pipeline(&pipeline, &actions, &conditions).unwrap();

    let mut loaded_actions = CommandGroup::create("actions", vec![]).unwrap();
    let mut loaded_conditions = CommandGroup::create("conditions", vec![]).unwrap();
    load_pipeline(&pipeline, &mut loaded_actions, &mut loaded_conditions).unwrap();

    let tree = ItemTree::from_dir_excluding(src.path(), &[pipeline.clone()]).unwrap();
    let batcher = Batcher::new(
        tree,
        BatchOptions {
            output_dir: out.path().to_path_buf(),
            ..BatchOptions::default()
        },
    );
    batcher.run(&loaded_actions, &loaded_conditions).unwrap();

    assert_eq!(files_in(out.path()), vec!["img1.png", "img2.png"]);
}

#[test]
fn config_file_and_overrides_drive_the_run() {
    let src = source(&["photo.png"]);
    let out = TempDir::new().unwrap();
    fs::write(
        src.path().join(config::CONFIG_FILE_NAME),
        "[rename]\npattern = \"from-file-[image name]\"\n",
    )
    .unwrap();

    let overrides = ConfigOverrides {
        file_extension: Some("jpg".to_string()),
        ..ConfigOverrides::default()
    };
    let config = config::load_config(src.path(), None, &overrides).unwrap();
    let report = run_config(src.path(), out.path(), &config);

    // the config file itself is an item too; it is exported like any file
    assert!(files_in(out.path()).contains(&"from-file-photo.jpg".to_string()));
    assert_eq!(report.written_count(), 2);
}

#[test]
fn missing_procedure_stops_the_run() {
    let src = source(&["a.png"]);
    let out = TempDir::new().unwrap();
    let db = InMemoryProcedureDatabase::from_json(r#"[{"name": "plug-in-sharpen", "arguments": []}]"#).unwrap();
    let db: Rc<dyn ProcedureDatabase> = Rc::new(db);

    let mut actions = CommandGroup::create("actions", vec![]).unwrap();
    actions.set_procedure_database(db);
    actions.add("plug-in-sharpen").unwrap();
    let conditions = CommandGroup::create("conditions", vec![]).unwrap();

    // the run has no procedure database, so the command cannot be resolved
    let err = batcher_for(src.path(), out.path(), false)
        .run(&actions, &conditions)
        .unwrap_err();
    assert!(matches!(err, BatchError::Command { ref command, .. } if command == "plug-in-sharpen"));
    assert!(files_in(out.path()).is_empty());
}

#[test]
fn procedures_run_for_each_item() {
    let src = source(&["a.png", "b.png"]);
    let out = TempDir::new().unwrap();
    let db = InMemoryProcedureDatabase::from_json(r#"[{"name": "plug-in-sharpen", "kind": "gegl"}]"#).unwrap();
    let db: Rc<dyn ProcedureDatabase> = Rc::new(db);

    let mut actions = CommandGroup::create("actions", vec![export_dict("png", OverwriteMode::Replace)]).unwrap();
    actions.set_procedure_database(db.clone());
    actions.add("plug-in-sharpen").unwrap();
    actions.reorder("plug-in-sharpen", 0).unwrap();
    let conditions = CommandGroup::create("conditions", vec![]).unwrap();

    let batcher = Batcher::new(
        ItemTree::from_dir(src.path()).unwrap(),
        BatchOptions {
            output_dir: out.path().to_path_buf(),
            procedures: Some(db),
            ..BatchOptions::default()
        },
    );
    let report = batcher.run(&actions, &conditions).unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(files_in(out.path()), vec!["a.png", "b.png"]);
}
