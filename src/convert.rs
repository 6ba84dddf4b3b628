//! CAD to mesh conversion.
//!
//! The input extension is mapped once onto [`InputKind`]; STEP and OBJ go
//! through a [`CadToolkit`], STL is copied as is. Every path ends with a
//! check that the output file exists.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::ConversionError;

pub const MESH_EXTENSION: &str = "stl";
pub const MESH_CONTENT_TYPE: &str = "model/stl";

/// Chordal tolerance for STEP tessellation, in model units.
pub const LINEAR_DEFLECTION: f64 = 0.1;
/// Angular tolerance for STEP tessellation, in radians.
pub const ANGULAR_DEFLECTION: f64 = 0.5;

/// Exit code the STEP macro uses when the file holds no shapes.
const NO_SHAPES_EXIT: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Step,
    Obj,
    Mesh,
    Unsupported(String),
}

impl InputKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "step" | "stp" => Self::Step,
            "obj" => Self::Obj,
            MESH_EXTENSION => Self::Mesh,
            _ => Self::Unsupported(ext),
        }
    }
}

/// Scratch path for the converted mesh: the input's sibling with the mesh
/// extension, or `<stem>.out.stl` when the input already is a mesh.
pub fn output_path_for(input: &Path) -> PathBuf {
    if InputKind::from_path(input) != InputKind::Mesh {
        return input.with_extension(MESH_EXTENSION);
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}.out.{MESH_EXTENSION}"))
}

/// Geometry operations delegated to an external CAD kernel.
#[async_trait]
pub trait CadToolkit: Send + Sync {
    /// Reads a STEP file as one shape (a compound of its root shapes, with
    /// each body appearing once) and writes the tessellated mesh to `output`.
    async fn tessellate_step(
        &self,
        input: &Path,
        output: &Path,
        linear_deflection: f64,
        angular_deflection: f64,
    ) -> Result<(), ConversionError>;

    /// Loads mesh geometry from an OBJ file and writes it to `output`.
    async fn mesh_obj(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;
}

/// Headless FreeCAD, driven with generated Python macros.
#[derive(Debug, Clone)]
pub struct FreeCadToolkit {
    command: String,
    scratch_dir: PathBuf,
}

impl FreeCadToolkit {
    pub fn new(command: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn step_macro(input: &Path, output: &Path, linear: f64, angular: f64) -> String {
        format!(
            r#"import os, sys, traceback
try:
    import MeshPart, Part
    shape = Part.read({input})
    if shape.isNull() or not shape.Faces:
        sys.stderr.write("no shapes imported\n")
        sys.stderr.flush()
        os._exit({NO_SHAPES_EXIT})
    mesh = MeshPart.meshFromShape(Shape=shape, LinearDeflection={linear}, AngularDeflection={angular}, Relative=False)
    mesh.write({output})
except Exception:
    traceback.print_exc()
    sys.stderr.flush()
    os._exit(1)
os._exit(0)
"#,
            input = py_str(input),
            output = py_str(output),
        )
    }

    fn obj_macro(input: &Path, output: &Path) -> String {
        format!(
            r#"import os, sys, traceback
try:
    import Mesh
    mesh = Mesh.Mesh({input})
    mesh.write({output})
except Exception:
    traceback.print_exc()
    sys.stderr.flush()
    os._exit(1)
os._exit(0)
"#,
            input = py_str(input),
            output = py_str(output),
        )
    }

    async fn run_macro(&self, script: String, input: &Path) -> Result<(), ConversionError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let script_path = self.scratch_dir.join(format!("{}.py", Uuid::new_v4()));
        tokio::fs::write(&script_path, script).await?;

        debug!(command = %self.command, script = %script_path.display(), "Running toolkit");
        let output = Command::new(&self.command)
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let _ = tokio::fs::remove_file(&script_path).await;
        let output = output.map_err(ConversionError::ToolkitLaunch)?;

        if output.status.success() {
            return Ok(());
        }

        let code = output.status.code().unwrap_or(-1);
        if code == NO_SHAPES_EXIT {
            return Err(ConversionError::NoShapes {
                path: input.to_path_buf(),
            });
        }

        let stderr: String = String::from_utf8_lossy(&output.stderr)
            .chars()
            .take(2000)
            .collect();
        error!(code, stderr = %stderr, "Toolkit failed");
        Err(ConversionError::ToolkitFailed { code, stderr })
    }
}

#[async_trait]
impl CadToolkit for FreeCadToolkit {
    async fn tessellate_step(
        &self,
        input: &Path,
        output: &Path,
        linear_deflection: f64,
        angular_deflection: f64,
    ) -> Result<(), ConversionError> {
        let script = Self::step_macro(input, output, linear_deflection, angular_deflection);
        self.run_macro(script, input).await
    }

    async fn mesh_obj(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        self.run_macro(Self::obj_macro(input, output), input).await
    }
}

/// A JSON string literal is also a valid Python string literal.
fn py_str(path: &Path) -> String {
    serde_json::Value::String(path.to_string_lossy().into_owned()).to_string()
}

#[derive(Clone)]
pub struct Converter {
    toolkit: Arc<dyn CadToolkit>,
}

impl Converter {
    pub fn new(toolkit: Arc<dyn CadToolkit>) -> Self {
        Self { toolkit }
    }

    #[instrument(skip_all, fields(input = %input.display(), output = %output.display()))]
    pub async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        match InputKind::from_path(input) {
            InputKind::Unsupported(extension) => {
                return Err(ConversionError::Unsupported { extension });
            }
            InputKind::Step => {
                self.toolkit
                    .tessellate_step(input, output, LINEAR_DEFLECTION, ANGULAR_DEFLECTION)
                    .await?
            }
            InputKind::Obj => self.toolkit.mesh_obj(input, output).await?,
            InputKind::Mesh => {
                tokio::fs::copy(input, output).await?;
            }
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(ConversionError::OutputMissing {
                path: output.to_path_buf(),
            });
        }

        info!("Converted");
        Ok(())
    }
}
