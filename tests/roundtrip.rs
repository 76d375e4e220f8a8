use acmi_bridge::acmi::{AcmiConverter, AcmiParser, AcmiWriter, UpdateEncoding, WriterOptions};
use acmi_bridge::config::DemoConfig;
use acmi_bridge::models::episode::FlightEpisode;
use acmi_bridge::models::traits::IEpisodeStore;
use acmi_bridge::service::{self, ImportOptions};
use acmi_bridge::simulation::{DemoEngine, FlightPattern};
use acmi_bridge::store::JsonlEpisodeStore;

fn demo(pattern: FlightPattern, agents: usize) -> Vec<FlightEpisode> {
    let config = DemoConfig { dt_s: 0.25, t_max_s: 5.0, agents, pattern, seed: 7 };
    let mut engine = DemoEngine::new(&config, 1_700_000_000.5);
    engine.initialize();
    engine.run()
}

fn assert_close(a: f64, b: f64, tolerance: f64) {
    assert!((a - b).abs() <= tolerance, "{} != {}", a, b);
}

fn assert_equivalent(before: &[FlightEpisode], after: &[FlightEpisode]) {
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after) {
        assert_eq!(a.episode_id, b.episode_id);
        assert_eq!(a.agent_id, b.agent_id);
        assert_eq!(a.success, b.success);
        assert_eq!(a.termination_reason, b.termination_reason);
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.config, b.config);
        assert_eq!(a.trajectory.len(), b.trajectory.len());

        for (p, q) in a.trajectory.iter().zip(&b.trajectory) {
            assert_close(p.timestamp, q.timestamp, 1e-9);
            assert_eq!(p.step, q.step);
            assert_close(p.position.x, q.position.x, 1e-6);
            assert_close(p.position.y, q.position.y, 1e-6);
            assert_close(p.position.z, q.position.z, 1e-6);
            assert_close(p.orientation.roll, q.orientation.roll, 1e-9);
            assert_close(p.orientation.pitch, q.orientation.pitch, 1e-9);
            assert_close(p.orientation.yaw, q.orientation.yaw, 1e-9);
            assert_eq!(p.velocity, q.velocity);
            assert_eq!(p.angular_velocity, q.angular_velocity);
            assert_eq!(p.telemetry, q.telemetry);
            assert_eq!(p.rl_metrics, q.rl_metrics);
            assert_eq!(p.events, q.events);
        }
    }
}

#[test]
fn demo_episodes_survive_both_encodings() {
    let dir = tempfile::tempdir().unwrap();
    let episodes = demo(FlightPattern::Circular, 3);

    for encoding in [UpdateEncoding::Full, UpdateEncoding::Delta] {
        let path = dir.path().join(format!("{:?}.txt.acmi", encoding));
        let options = WriterOptions { encoding, ..WriterOptions::default() };
        AcmiWriter::new(options).write_file(&episodes, &path).unwrap();

        let imported = AcmiConverter::default().import_file(&path).unwrap();
        assert!(imported.warnings.is_empty(), "{:?}", imported.warnings);
        assert_equivalent(&episodes, &imported.value.episodes);
    }
}

#[test]
fn delta_encoding_is_smaller_than_full() {
    let episodes = demo(FlightPattern::Straight, 2);
    let full = AcmiWriter::default().write_to_string(&episodes);
    let options = WriterOptions { encoding: UpdateEncoding::Delta, ..WriterOptions::default() };
    let delta = AcmiWriter::new(options).write_to_string(&episodes);
    assert!(delta.len() < full.len());

    let parsed = AcmiParser::new().parse_str(&delta).unwrap().value;
    assert_eq!(parsed.objects.len(), 2);
    assert_eq!(parsed.events.len(), 3);
}

#[test]
fn store_export_import_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let episodes = demo(FlightPattern::Circular, 2);

    let mut store = JsonlEpisodeStore::new(dir.path().join("source"));
    for episode in &episodes {
        store.append("demo", episode).unwrap();
    }

    let acmi = dir.path().join("export").join("demo.txt.acmi");
    let options = WriterOptions::default();
    let count = service::export_to_acmi(store.root(), &acmi, "demo", None, &options).unwrap();
    assert_eq!(count, 2);

    let options = ImportOptions { agent_prefix: String::new(), ..ImportOptions::default() };
    let target = dir.path().join("target");
    let report = service::import_acmi(&acmi, &target, &options).unwrap();
    assert_eq!(report.episodes.len(), 2);

    let reloaded = JsonlEpisodeStore::new(&target).load_all("imported").unwrap();
    assert_equivalent(&episodes, &reloaded);
}

#[test]
fn batch_import_keeps_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir_all(&input).unwrap();

    for name in ["alpha", "bravo", "charlie"] {
        let path = input.join(format!("{}.txt.acmi", name));
        AcmiWriter::default().write_file(&demo(FlightPattern::Straight, 2), &path).unwrap();
    }
    std::fs::write(input.join("notes.txt"), "not an acmi file").unwrap();

    let store_dir = dir.path().join("store");
    let options = ImportOptions::default();
    let report = service::batch_import_acmi(&input, &store_dir, "*.txt.acmi", 3, &options).unwrap();
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.total_episodes(), 6);

    let summaries = JsonlEpisodeStore::new(&store_dir).list("imported").unwrap();
    let mut agents: Vec<String> = summaries.iter().map(|s| s.agent_id.clone()).collect();
    agents.sort();
    agents.dedup();
    assert_eq!(agents.len(), 6);
    assert!(agents.contains(&"acmi_agent_01@charlie".to_string()));
}

#[test]
fn batch_import_with_shared_name_prefix_keeps_every_episode() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir_all(&input).unwrap();

    let episodes = demo(FlightPattern::Circular, 1);
    for name in ["sortie.1.txt.acmi", "sortie.2.txt.acmi", "sortie.3.txt.acmi"] {
        AcmiWriter::default().write_file(&episodes, input.join(name)).unwrap();
    }

    let store_dir = dir.path().join("store");
    let options = ImportOptions::default();
    let report = service::batch_import_acmi(&input, &store_dir, "*.txt.acmi", 2, &options).unwrap();
    assert_eq!(report.total_episodes(), 3);

    let stored = JsonlEpisodeStore::new(&store_dir).load_all("imported").unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[2].agent_id, "acmi_agent_01@sortie.3");
    for episode in &stored {
        assert_eq!(episode.trajectory.len(), episodes[0].trajectory.len());
    }
}
