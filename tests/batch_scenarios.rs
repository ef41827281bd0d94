//! Whole-batch scenarios driven through scripted page drivers
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use postal_resolver::infrastructure::page_driver::{ConnectivityProbe, DriverFactory};
use postal_resolver::infrastructure::tabular::{TabularFormat, read_result_rows};
use postal_resolver::resolver::{BatchRunner, ResolverError};
use postal_resolver::test_utils::{Script, ScriptedDriverFactory, ScriptedProbe, test_config};

fn write_input(dir: &Path, name: &str, keys: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut body = String::from("zip\n");
    for key in keys {
        body.push_str(key);
        body.push('\n');
    }
    std::fs::write(&path, body).unwrap();
    path
}

fn runner(factory: &Arc<ScriptedDriverFactory>) -> BatchRunner {
    BatchRunner::new(
        test_config(),
        Arc::clone(factory) as Arc<dyn DriverFactory>,
        Arc::new(ScriptedProbe::online()) as Arc<dyn ConnectivityProbe>,
    )
}

/// (key, status, error type) per output row
fn output_rows(path: &Path) -> Vec<(String, String, String)> {
    read_result_rows(path, TabularFormat::Csv)
        .unwrap()
        .into_iter()
        .map(|(key, row)| (key.to_string(), row[1].clone(), row[3].clone()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn end_to_end_ok_no_data_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["90210", "00000", "99999"]);
    let output = dir.path().join("out.csv");

    let factory = Arc::new(
        ScriptedDriverFactory::new()
            .with_script("90210", Script::success("https://maps.test/90210.pdf"))
            .with_script("00000", Script::no_data("No results found"))
            .with_script("99999", Script::Never),
    );
    let summary = runner(&factory).run(&input, Some(&output)).await.unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.output, output);
    assert!(!summary.stopped);

    let mut rows = output_rows(&output);
    rows.sort();
    assert_eq!(
        rows,
        vec![
            ("00000".to_string(), "NO_DATA".to_string(), "NO_DATA".to_string()),
            ("90210".to_string(), "OK".to_string(), String::new()),
            ("99999".to_string(), "SKIPPED".to_string(), "RESULT_TIMEOUT".to_string()),
        ]
    );

    // the never-terminating key used exactly the retry budget
    assert_eq!(
        factory.submission_count("99999"),
        test_config().resolver.max_retries as usize
    );
    assert_eq!(factory.submission_count("90210"), 1);
    assert_eq!(factory.submission_count("00000"), 1);
}

#[tokio::test(start_paused = true)]
async fn resumption_processes_only_new_keys() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");
    let success = Script::success("https://maps.test/map.pdf");

    let first = Arc::new(ScriptedDriverFactory::new().with_default(success.clone()));
    let input = write_input(dir.path(), "first.csv", &["10001", "60601"]);
    runner(&first).run(&input, Some(&output)).await.unwrap();

    let second = Arc::new(ScriptedDriverFactory::new().with_default(success));
    let input = write_input(dir.path(), "second.csv", &["10001", "60601", "73301"]);
    let summary = runner(&second).run(&input, Some(&output)).await.unwrap();

    assert_eq!(second.submissions(), vec!["73301".to_string()]);
    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(output_rows(&output).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn disjoint_runs_merge_into_one_table() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");
    let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.test/map.pdf")));

    let input = write_input(dir.path(), "a.csv", &["10001", "10002"]);
    runner(&factory).run(&input, Some(&output)).await.unwrap();
    let input = write_input(dir.path(), "b.csv", &["20001", "20002", "20003"]);
    runner(&factory).run(&input, Some(&output)).await.unwrap();

    let keys: Vec<String> = output_rows(&output).into_iter().map(|(k, _, _)| k).collect();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), 5);
    assert_eq!(unique.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_messy_keys_are_normalized_and_dispatched_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["501", "00501", "501.0", " 0501 ", "n/a"]);
    let output = dir.path().join("out.csv");

    let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.test/map.pdf")));
    let summary = runner(&factory).run(&input, Some(&output)).await.unwrap();

    assert_eq!(summary.total, 4);
    assert_eq!(summary.duplicates, 3);
    assert_eq!(factory.submissions(), vec!["00501".to_string()]);
    assert_eq!(output_rows(&output).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn spreadsheet_output_is_written_as_csv() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["90210"]);
    let requested = dir.path().join("maps.xlsx");

    let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.test/map.pdf")));
    let summary = runner(&factory).run(&input, Some(&requested)).await.unwrap();

    assert_eq!(summary.output, dir.path().join("maps.csv"));
    assert!(summary.output.exists());
    assert!(!requested.exists());
}

#[tokio::test(start_paused = true)]
async fn default_output_lands_next_to_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["90210"]);

    let factory = Arc::new(ScriptedDriverFactory::new().with_default(Script::success("https://maps.test/map.pdf")));
    let summary = runner(&factory).run(&input, None).await.unwrap();

    assert_eq!(summary.output, dir.path().join("result_zips.csv"));
    assert_eq!(output_rows(&summary.output).len(), 1);
}

#[tokio::test]
async fn input_without_keys_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["n/a", ""]);

    let factory = Arc::new(ScriptedDriverFactory::new());
    let err = runner(&factory).run(&input, None).await.unwrap_err();
    assert!(matches!(err, ResolverError::NoKeys(_)));
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn unsupported_input_format_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("zips.json");
    std::fs::write(&input, "[\"90210\"]").unwrap();

    let factory = Arc::new(ScriptedDriverFactory::new());
    let err = runner(&factory).run(&input, None).await.unwrap_err();
    assert!(matches!(err, ResolverError::Input(_)));
}

#[tokio::test(start_paused = true)]
async fn artifacts_land_next_to_the_output_and_fill_their_column() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "zips.csv", &["90210", "00000"]);
    let out_dir = dir.path().join("results");
    std::fs::create_dir_all(&out_dir).unwrap();
    let output = out_dir.join("out.csv");

    let mut config = test_config();
    config.output.save_artifacts = true;
    let factory = Arc::new(
        ScriptedDriverFactory::new()
            .with_script("90210", Script::success("https://maps.test/90210.pdf"))
            .with_script("00000", Script::no_data("No results found")),
    );
    let runner = BatchRunner::new(
        config,
        Arc::clone(&factory) as Arc<dyn DriverFactory>,
        Arc::new(ScriptedProbe::online()) as Arc<dyn ConnectivityProbe>,
    );
    runner.run(&input, Some(&output)).await.unwrap();

    let saved = out_dir.join("images").join("90210.pdf");
    assert_eq!(std::fs::read_to_string(&saved).unwrap(), "artifact:https://maps.test/90210.pdf");

    let rows = read_result_rows(&output, TabularFormat::Csv).unwrap();
    let artifact_of = |key: &str| {
        rows.iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, row)| row[8].clone())
            .unwrap()
    };
    assert_eq!(artifact_of("90210"), saved.display().to_string());
    assert_eq!(artifact_of("00000"), "");
}
