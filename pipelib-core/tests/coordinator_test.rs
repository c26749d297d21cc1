mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{scm_library, source_library, FakeScm, Harness};
use indexmap::IndexMap;
use pipelib_core::config::{LibraryCachingConfiguration, LibraryConfiguration};
use pipelib_core::context::JobRef;
use pipelib_core::coordinator::{LibraryResolver, LibraryUse};
use pipelib_core::record::LibrariesRecord;
use pipelib_core::report::RecordingReporter;
use pipelib_core::{Error, Result};

fn scm_with(versions: &[&str], var: &str) -> Arc<FakeScm> {
    let mut scm = FakeScm::new(&format!("git://example.com/{}.git", var));
    let path = format!("vars/{}.groovy", var);
    for version in versions {
        scm = scm.with_version(version, &[(path.as_str(), "def call() {}")]);
    }
    scm
}

fn parse(specs: &[&str]) -> Vec<LibraryUse> {
    specs.iter().map(|s| LibraryUse::parse(s).unwrap()).collect()
}

#[test]
fn test_first_declaration_wins() {
    let scm = scm_with(&["1.0", "2.0"], "utils");
    let harness = Harness::new(vec![source_library("utils", scm.clone())]);
    let reporter = RecordingReporter::new();

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0", "utils@2.0"]), &harness.context("job", "1"), &reporter)
        .unwrap();

    assert_eq!(libraries.records().len(), 1);
    assert_eq!(libraries.records()[0].version, "1.0");
    assert!(reporter.contains("Loading library utils@1.0"));
    assert!(reporter.contains("Only using first definition of library utils"));
    assert_eq!(scm.fetches(), 1);
}

#[test]
fn test_record_is_persisted() {
    let scm = scm_with(&["1.0"], "deploy");
    let config = source_library("utils", scm)
        .with_default_version("1.0")
        .with_changelog(false)
        .with_caching(LibraryCachingConfiguration::new(10));
    let harness = Harness::new(vec![config]);
    let ctx = harness.context("job", "1");

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["utils"]), &ctx, &RecordingReporter::new())
        .unwrap();
    let bundle = libraries.bundle("utils").unwrap().to_path_buf();
    assert!(bundle.starts_with(libraries.libs_dir()));
    libraries.close().unwrap();
    assert!(!bundle.exists());

    let record = LibrariesRecord::load(&ctx.build_dir).unwrap();
    let utils = record.get("utils").unwrap();
    assert_eq!(utils.version, "1.0");
    assert_eq!(utils.variables, vec!["deploy"]);
    assert!(utils.trusted);
    assert!(!utils.changelog);
    assert_eq!(utils.caching.as_ref().unwrap().refresh_minutes, 10);
    assert_eq!(utils.directory_name.len(), 64);
}

#[test]
fn test_missing_library_without_resolvers() {
    let harness = Harness::new(vec![]);
    let err = harness
        .coordinator
        .resolve_all(&parse(&["nope"]), &harness.context("job", "1"), &RecordingReporter::new())
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "No library named nope found");
}

struct MapResolver {
    trusted: bool,
    libraries: Vec<LibraryConfiguration>,
}

impl LibraryResolver for MapResolver {
    fn name(&self) -> &str {
        "map"
    }

    fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn for_job(
        &self,
        _job: &JobRef,
        requested: &IndexMap<String, Option<String>>,
    ) -> Result<Vec<LibraryConfiguration>> {
        Ok(self
            .libraries
            .iter()
            .filter(|c| c.implicit || requested.contains_key(c.name()))
            .cloned()
            .collect())
    }
}

#[test]
fn test_missing_libraries_with_resolvers() {
    let harness = Harness::new(vec![]);
    harness
        .coordinator
        .register_resolver(
            0,
            Arc::new(MapResolver {
                trusted: false,
                libraries: vec![],
            }),
        )
        .unwrap();

    let err = harness
        .coordinator
        .resolve_all(&parse(&["a", "b"]), &harness.context("job", "1"), &RecordingReporter::new())
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "Could not find any definition of libraries [a, b]");
}

#[test]
fn test_dynamic_resolvers_in_priority_order() {
    let first = scm_with(&["1.0"], "first");
    let second = scm_with(&["1.0"], "second");
    let harness = Harness::new(vec![]);
    harness
        .coordinator
        .register_resolver(
            20,
            Arc::new(MapResolver {
                trusted: true,
                libraries: vec![source_library("dyn", second.clone())],
            }),
        )
        .unwrap();
    harness
        .coordinator
        .register_resolver(
            10,
            Arc::new(MapResolver {
                trusted: false,
                libraries: vec![source_library("dyn", first.clone())],
            }),
        )
        .unwrap();

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["dyn@1.0"]), &harness.context("job", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(libraries.records()[0].variables, vec!["first"]);
    assert!(!libraries.records()[0].trusted);
    assert_eq!(first.fetches(), 1);
    assert_eq!(second.fetches(), 0);
}

#[test]
fn test_nearest_scope_wins() {
    let global = scm_with(&["1.0"], "global_utils");
    let team = scm_with(&["1.0"], "team_utils");
    let mut folders = BTreeMap::new();
    folders.insert("team".to_string(), vec![source_library("utils", team.clone())]);
    let harness = Harness::with_folders(vec![source_library("utils", global.clone())], folders);

    let in_team = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("team/app", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(in_team.records()[0].variables, vec!["team_utils"]);
    assert!(!in_team.records()[0].trusted);

    let elsewhere = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("other/app", "2"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(elsewhere.records()[0].variables, vec!["global_utils"]);
    assert!(elsewhere.records()[0].trusted);
    assert_ne!(
        in_team.records()[0].directory_name,
        elsewhere.records()[0].directory_name
    );
}

#[test]
fn test_crafted_names_use_distinct_storage() {
    let plain = scm_with(&["1.0"], "plain");
    let crafted = scm_with(&["1.0"], "crafted");
    let caching = LibraryCachingConfiguration::new(0);
    let harness = Harness::new(vec![
        source_library("global", plain.clone()).with_caching(caching.clone()),
        source_library("folder/../global", crafted.clone()).with_caching(caching),
    ]);

    let libraries = harness
        .coordinator
        .resolve_all(
            &parse(&["global@1.0", "folder/../global@1.0"]),
            &harness.context("job", "1"),
            &RecordingReporter::new(),
        )
        .unwrap();
    let records = libraries.records();
    assert_eq!(records[0].variables, vec!["plain"]);
    assert_eq!(records[1].variables, vec!["crafted"]);
    assert_ne!(records[0].directory_name, records[1].directory_name);
    assert_eq!(harness.coordinator.cache().list().unwrap().len(), 2);
    assert_eq!(plain.fetches(), 1);
    assert_eq!(crafted.fetches(), 1);
}

#[test]
fn test_folder_named_global_does_not_share_global_storage() {
    let trusted = FakeScm::new("git://shared/utils.git").with_version("1.0", &[("vars/trusted.groovy", "")]);
    let sandboxed = FakeScm::new("git://shared/utils.git").with_version("1.0", &[("vars/evil.groovy", "")]);
    let caching = LibraryCachingConfiguration::new(0);
    let mut folders = BTreeMap::new();
    folders.insert(
        "global".to_string(),
        vec![source_library("utils", sandboxed.clone()).with_caching(caching.clone())],
    );
    let harness = Harness::with_folders(
        vec![source_library("utils", trusted.clone()).with_caching(caching)],
        folders,
    );

    let in_folder = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("global/app", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(in_folder.records()[0].variables, vec!["evil"]);
    assert!(!in_folder.records()[0].trusted);

    let elsewhere = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("other", "2"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(elsewhere.records()[0].variables, vec!["trusted"]);
    assert!(elsewhere.records()[0].trusted);
    assert_ne!(
        in_folder.records()[0].directory_name,
        elsewhere.records()[0].directory_name
    );
    assert_eq!(trusted.fetches(), 1);
    assert_eq!(sandboxed.fetches(), 1);
    assert_eq!(harness.coordinator.cache().list().unwrap().len(), 2);
}

#[test]
fn test_trusted_resolver_does_not_share_global_storage() {
    let dynamic = FakeScm::new("git://shared/utils.git").with_version("1.0", &[("vars/dynamic.groovy", "")]);
    let static_scm = FakeScm::new("git://shared/utils.git").with_version("1.0", &[("vars/static.groovy", "")]);
    let caching = LibraryCachingConfiguration::new(0);
    let harness = Harness::new(vec![]);
    harness
        .coordinator
        .register_resolver(
            0,
            Arc::new(MapResolver {
                trusted: true,
                libraries: vec![source_library("utils", dynamic.clone()).with_caching(caching.clone())],
            }),
        )
        .unwrap();

    let resolved = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("job", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(resolved.records()[0].variables, vec!["dynamic"]);
    assert!(resolved.records()[0].trusted);

    harness
        .store
        .update(|settings| {
            settings
                .global
                .push(source_library("utils", static_scm.clone()).with_caching(caching.clone()));
            Ok(())
        })
        .unwrap();

    let declared = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("job", "2"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(declared.records()[0].variables, vec!["static"]);
    assert!(declared.records()[0].trusted);
    assert_ne!(
        resolved.records()[0].directory_name,
        declared.records()[0].directory_name
    );
    assert_eq!(dynamic.fetches(), 1);
    assert_eq!(static_scm.fetches(), 1);
    assert_eq!(harness.coordinator.cache().list().unwrap().len(), 2);
}

#[test]
fn test_implicit_libraries_are_appended() {
    let auto = scm_with(&["1.0"], "auto");
    let explicit = scm_with(&["1.0"], "explicit");
    let harness = Harness::new(vec![
        source_library("auto", auto)
            .with_default_version("1.0")
            .with_implicit(true),
        source_library("explicit", explicit),
    ]);

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["explicit@1.0"]), &harness.context("job", "1"), &RecordingReporter::new())
        .unwrap();
    let names: Vec<_> = libraries.records().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["explicit", "auto"]);
}

#[test]
fn test_step_style_load() {
    let scm = scm_with(&["1.0"], "late");
    let harness = Harness::new(vec![source_library("late", scm)]);
    let ctx = harness.context("job", "1");
    let reporter = RecordingReporter::new();

    let mut libraries = harness.coordinator.resolve_all(&[], &ctx, &reporter).unwrap();
    assert!(libraries.records().is_empty());

    let record = harness
        .coordinator
        .load(&mut libraries, &LibraryUse::parse("late@1.0").unwrap(), &ctx, &reporter)
        .unwrap();
    assert_eq!(record.variables, vec!["late"]);
    assert_eq!(libraries.variables(), vec![("late", "late")]);

    harness
        .coordinator
        .load(&mut libraries, &LibraryUse::parse("late@2.0").unwrap(), &ctx, &reporter)
        .unwrap();
    assert!(reporter.contains("Only using first definition of library late"));

    let err = harness
        .coordinator
        .load(&mut libraries, &LibraryUse::parse("absent").unwrap(), &ctx, &reporter)
        .unwrap_err();
    assert!(matches!(err, Error::LibraryNotFound { .. }));
    assert_eq!(LibrariesRecord::load(&ctx.build_dir).unwrap().libraries.len(), 1);
}

#[test]
fn test_resource_lookup_across_libraries() {
    let a = FakeScm::new("git://a").with_version(
        "1.0",
        &[("vars/a.groovy", ""), ("resources/shared.txt", "from a"), ("resources/a/only.txt", "a")],
    );
    let b = FakeScm::new("git://b").with_version(
        "1.0",
        &[("vars/b.groovy", ""), ("resources/shared.txt", "from b")],
    );
    let harness = Harness::new(vec![scm_library("a", a), scm_library("b", b)]);

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["a@1.0", "b@1.0"]), &harness.context("job", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(libraries.resource("a/only.txt").unwrap(), b"a");
    assert!(matches!(
        libraries.resource("shared.txt"),
        Err(Error::AmbiguousResource { ref libraries, .. }) if libraries == &["a", "b"]
    ));
    assert_eq!(
        libraries.resource("missing.txt").unwrap_err().to_string(),
        "No such library resource missing.txt could be found."
    );
}

#[test]
fn test_branch_placeholder_without_permission() {
    let scm = scm_with(&["main"], "utils");
    let config = source_library("utils", scm)
        .with_default_version("main")
        .with_override(false);
    let harness = Harness::new(vec![config]);
    let ctx = harness.context("job", "1").with_head_name("main");

    let err = harness
        .coordinator
        .resolve_all(&parse(&["utils@${BRANCH_NAME}"]), &ctx, &RecordingReporter::new())
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "Version override not permitted for library utils");
}

#[test]
fn test_settings_update_is_seen_by_next_build() {
    let scm = scm_with(&["1.0"], "utils");
    let harness = Harness::new(vec![]);
    let before = harness.store.version();

    harness
        .store
        .update(|settings| {
            settings.global.push(source_library("utils", scm.clone()));
            Ok(())
        })
        .unwrap();
    assert_eq!(harness.store.version(), before + 1);

    let libraries = harness
        .coordinator
        .resolve_all(&parse(&["utils@1.0"]), &harness.context("job", "1"), &RecordingReporter::new())
        .unwrap();
    assert_eq!(libraries.records().len(), 1);

    let duplicate = harness.store.update(|settings| {
        settings.global.push(source_library("utils", scm.clone()));
        Ok(())
    });
    assert!(matches!(duplicate, Err(Error::InvalidConfiguration(_))));
}
