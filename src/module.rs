//! Test modules: package metadata plus the filtered list of test methods.
//!
//! Package metadata comes from a [`PackageInspector`]. droidshard ships
//! [`ManifestInspector`], which reads a JSON manifest written next to each
//! test APK by the build:
//!
//! ```json
//! {
//!   "test_package": "com.example.app.test",
//!   "target_package": "com.example.app",
//!   "runner": "androidx.test.runner.AndroidJUnitRunner",
//!   "methods": [
//!     {
//!       "class": "com.example.app.LoginTest",
//!       "method": "logsIn",
//!       "annotations": ["org.junit.Test", "androidx.test.filters.LargeTest"]
//!     }
//!   ]
//! }
//! ```
//!
//! [`load_modules`] applies the configured [`FilterConfig`] and decides
//! whether an application APK must be installed alongside the tests.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, FilterConfig};

/// Errors raised while building test modules.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Failed to read test manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse test manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Test manifest {path} has no {field}")]
    MissingField { path: PathBuf, field: &'static str },

    #[error(
        "{test_package} instruments {target_package}, but no app_apk is configured for {test_apk}"
    )]
    MissingAppApk {
        test_package: String,
        target_package: String,
        test_apk: PathBuf,
    },

    #[error("Invalid class regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// Identity of one test method.
///
/// Joins instrumentation results, logcat segments and device-side files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestDetails {
    /// Fully-qualified class name.
    pub class: String,
    /// Method name.
    pub method: String,
}

impl TestDetails {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for TestDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.method)
    }
}

/// A test method found in a test APK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMethodRef {
    /// Fully-qualified class name.
    pub class: String,

    /// Method name.
    pub method: String,

    /// Fully-qualified annotation names on the method (class annotations
    /// included).
    #[serde(default)]
    pub annotations: BTreeSet<String>,
}

impl TestMethodRef {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            annotations: BTreeSet::new(),
        }
    }

    /// Adds an annotation.
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotations.insert(annotation.into());
        self
    }

    pub fn details(&self) -> TestDetails {
        TestDetails::new(&self.class, &self.method)
    }

    /// `Class#method`, the form `am instrument -e class` expects.
    pub fn test_name(&self) -> String {
        format!("{}#{}", self.class, self.method)
    }

    fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a.contains(name))
    }
}

/// An installable package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package: String,
    pub apk: PathBuf,
}

/// Everything needed to install and instrument one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestModuleInfo {
    /// The test APK.
    pub test: PackageInfo,

    /// Instrumentation runner class.
    pub runner: String,

    /// The application under test, when it is a separate APK.
    pub app: Option<PackageInfo>,
}

/// A module and the methods selected to run from it.
#[derive(Debug, Clone)]
pub struct TestModule {
    pub info: Arc<TestModuleInfo>,
    pub methods: Vec<TestMethodRef>,
}

/// Metadata read out of a test APK.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub test_package: String,
    #[serde(default)]
    pub target_package: String,
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub methods: Vec<TestMethodRef>,
}

/// Extracts package metadata from test APKs.
#[async_trait]
pub trait PackageInspector: Send + Sync {
    /// Returns the packages, runner and test methods of `test_apk`.
    async fn inspect(&self, test_apk: &Path) -> Result<PackageMetadata, ModuleError>;
}

/// Reads `<apk stem>.tests.json` next to the test APK.
#[derive(Debug, Default, Clone)]
pub struct ManifestInspector;

impl ManifestInspector {
    /// Location of the manifest belonging to `test_apk`.
    pub fn manifest_path(test_apk: &Path) -> PathBuf {
        test_apk.with_extension("tests.json")
    }
}

#[async_trait]
impl PackageInspector for ManifestInspector {
    async fn inspect(&self, test_apk: &Path) -> Result<PackageMetadata, ModuleError> {
        let path = Self::manifest_path(test_apk);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ModuleError::Read {
                path: path.clone(),
                source,
            })?;
        let metadata: PackageMetadata =
            serde_json::from_str(&content).map_err(|source| ModuleError::Parse {
                path: path.clone(),
                source,
            })?;

        for (field, value) in [
            ("test_package", &metadata.test_package),
            ("target_package", &metadata.target_package),
            ("runner", &metadata.runner),
        ] {
            if value.trim().is_empty() {
                return Err(ModuleError::MissingField { path, field });
            }
        }
        Ok(metadata)
    }
}

/// Annotation and class-name filters from `[filter]`.
#[derive(Debug, Clone)]
pub struct TestFilter {
    annotations: Vec<String>,
    not_annotations: Vec<String>,
    class_patterns: Vec<Regex>,
}

impl TestFilter {
    /// Compiles the class regexes of `config`.
    ///
    /// Each regex must match the whole class name.
    pub fn new(config: &FilterConfig) -> Result<Self, ModuleError> {
        let class_patterns = config
            .class_regexes
            .iter()
            .map(|re| Regex::new(&format!("^(?:{})$", re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            annotations: config.annotations.clone(),
            not_annotations: config.not_annotations.clone(),
            class_patterns,
        })
    }

    /// Whether `method` should run.
    pub fn matches(&self, method: &TestMethodRef) -> bool {
        self.annotations.iter().all(|a| method.has_annotation(a))
            && !self.not_annotations.iter().any(|a| method.has_annotation(a))
            && (self.class_patterns.is_empty()
                || self.class_patterns.iter().any(|p| p.is_match(&method.class)))
    }
}

/// Inspects every configured module and keeps the methods passing the
/// filters, in manifest order.
pub async fn load_modules<I: PackageInspector>(
    config: &Config,
    inspector: &I,
) -> Result<Vec<TestModule>, ModuleError> {
    let filter = TestFilter::new(&config.filter)?;
    let mut modules = Vec::with_capacity(config.modules.len());

    for module in &config.modules {
        let metadata = inspector.inspect(&module.test_apk).await?;
        let found = metadata.methods.len();
        let methods: Vec<_> = metadata
            .methods
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        info!(
            "{}: {} of {} test methods selected",
            metadata.test_package,
            methods.len(),
            found
        );

        let app = if metadata.test_package != metadata.target_package {
            let Some(apk) = &module.app_apk else {
                return Err(ModuleError::MissingAppApk {
                    test_package: metadata.test_package,
                    target_package: metadata.target_package,
                    test_apk: module.test_apk.clone(),
                });
            };
            Some(PackageInfo {
                package: metadata.target_package.clone(),
                apk: apk.clone(),
            })
        } else {
            debug!("{} instruments itself", metadata.test_package);
            None
        };

        modules.push(TestModule {
            info: Arc::new(TestModuleInfo {
                test: PackageInfo {
                    package: metadata.test_package,
                    apk: module.test_apk.clone(),
                },
                runner: metadata.runner,
                app,
            }),
            methods,
        });
    }

    Ok(modules)
}
