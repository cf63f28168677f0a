use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{Cancellation, CompileJob, CompileKind, Compiler, Instruction, Recipe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpErrorKind {
    /// Unrecognized instruction.
    BadOp,
    /// Referenced input is not in the pool or was already consumed.
    FileUnavailable,
    /// Object-file counter reached the configured cap.
    ObjOverflow,
    /// No compiler driver was supplied for a compile instruction.
    NilCompiler,
    /// The shared cancellation signal fired mid-program.
    Cancelled,
    /// The driver reported a compiler failure. Recoverable per subject;
    /// every other kind is structural and aborts the batch.
    Compiler,
}

#[derive(Debug, Clone)]
pub struct InterpError {
    pub kind: InterpErrorKind,
    pub message: String,
}

impl InterpError {
    fn new(kind: InterpErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for InterpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for InterpError {}

/// Explicit, resumable interpreter state: program counter, input pool,
/// file stack, object counter. Re-entrant `interpret` continues from the
/// stored counter; the state is owned by exactly one caller.
pub struct Interpreter<'a> {
    driver: Option<&'a dyn Compiler>,
    recipe: &'a Recipe,
    obj_dir: PathBuf,
    max_objs: Option<u64>,

    pc: usize,
    pool: BTreeMap<String, bool>,
    stack: Vec<PathBuf>,
    obj_counter: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        driver: Option<&'a dyn Compiler>,
        recipe: &'a Recipe,
        max_objs: Option<u64>,
    ) -> Self {
        let pool = recipe
            .inputs
            .iter()
            .map(|n| (n.clone(), true))
            .collect::<BTreeMap<_, _>>();
        Self {
            driver,
            recipe,
            obj_dir: recipe.dir.clone(),
            max_objs,
            pc: 0,
            pool,
            stack: Vec::new(),
            obj_counter: 0,
        }
    }

    /// Redirects allocated object files (and nothing else) to `dir`. Used
    /// by the compile stage to keep per-compiler artifacts apart.
    pub fn with_object_dir(mut self, dir: PathBuf) -> Self {
        self.obj_dir = dir;
        self
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Executes instructions from the stored program counter to the end of
    /// the recipe, or until the first error.
    pub fn interpret(&mut self, cancel: &dyn Cancellation) -> Result<(), InterpError> {
        while self.pc < self.recipe.instructions.len() {
            if cancel.is_cancelled() {
                return Err(InterpError::new(
                    InterpErrorKind::Cancelled,
                    format!("cancelled at pc={}", self.pc),
                ));
            }
            let instr = self.recipe.instructions[self.pc].clone();
            self.step(&instr)?;
            self.pc += 1;
        }
        Ok(())
    }

    fn step(&mut self, instr: &Instruction) -> Result<(), InterpError> {
        match instr {
            Instruction::Nop => Ok(()),
            Instruction::PushInput { file } => self.push_input(file),
            Instruction::PushInputs { kind } => {
                // Pool iteration order is the BTreeMap key order, so
                // multi-file pushes are deterministic by name.
                let matching: Vec<String> = self
                    .pool
                    .iter()
                    .filter(|(name, avail)| **avail && crate::FileKind::guess(name) == *kind)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in matching {
                    self.push_input(&name)?;
                }
                Ok(())
            }
            Instruction::CompileObj { npop } => {
                let output = self.alloc_obj()?;
                self.compile(CompileKind::Obj, *npop, &output)?;
                self.obj_counter += 1;
                self.stack.push(output);
                Ok(())
            }
            Instruction::CompileExe { npop } => {
                // A binary is a terminal artifact; nothing is pushed back.
                let output = self.recipe.output_path();
                self.compile(CompileKind::Exe, *npop, &output)
            }
            Instruction::Unknown => Err(InterpError::new(
                InterpErrorKind::BadOp,
                format!("unrecognized instruction at pc={}", self.pc),
            )),
        }
    }

    fn push_input(&mut self, name: &str) -> Result<(), InterpError> {
        match self.pool.get_mut(name) {
            Some(avail) if *avail => {
                *avail = false;
                self.stack.push(self.recipe.dir.join(name));
                Ok(())
            }
            Some(_) => Err(InterpError::new(
                InterpErrorKind::FileUnavailable,
                format!("input already consumed: {name}"),
            )),
            None => Err(InterpError::new(
                InterpErrorKind::FileUnavailable,
                format!("input not in pool: {name}"),
            )),
        }
    }

    fn alloc_obj(&self) -> Result<PathBuf, InterpError> {
        if self.max_objs.is_some_and(|cap| self.obj_counter >= cap) {
            return Err(InterpError::new(
                InterpErrorKind::ObjOverflow,
                format!("object counter reached cap {}", self.obj_counter),
            ));
        }
        Ok(self.obj_dir.join(format!("obj_{}.o", self.obj_counter)))
    }

    fn compile(
        &mut self,
        kind: CompileKind,
        npop: i64,
        output: &std::path::Path,
    ) -> Result<(), InterpError> {
        let driver = self.driver.ok_or_else(|| {
            InterpError::new(
                InterpErrorKind::NilCompiler,
                format!("no compiler configured at pc={}", self.pc),
            )
        })?;
        let inputs = self.pop_stack(npop);
        let job = CompileJob {
            kind,
            inputs: &inputs,
            output,
        };
        driver.run_compile(&job).map_err(|err| {
            InterpError::new(InterpErrorKind::Compiler, format!("{err:#}"))
        })
    }

    /// Pops the top `n` stack entries in LIFO order; `n <= 0` or `n` beyond
    /// the stack depth pops everything.
    fn pop_stack(&mut self, n: i64) -> Vec<PathBuf> {
        let len = self.stack.len();
        let take = if n <= 0 || n as usize > len {
            len
        } else {
            n as usize
        };
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(top) = self.stack.pop() {
                out.push(top);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::NeverCancelled;

    /// Records every job instead of shelling out.
    #[derive(Default)]
    struct RecordingCompiler {
        calls: Mutex<Vec<(CompileKind, Vec<PathBuf>, PathBuf)>>,
        fail_with: Option<String>,
    }

    impl Compiler for RecordingCompiler {
        fn run_compile(&self, job: &CompileJob<'_>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((
                job.kind,
                job.inputs.to_vec(),
                job.output.to_path_buf(),
            ));
            match &self.fail_with {
                Some(msg) => anyhow::bail!("{msg}"),
                None => Ok(()),
            }
        }
    }

    fn recipe(inputs: &[&str], instructions: Vec<Instruction>) -> Recipe {
        Recipe {
            dir: PathBuf::from("/work/s"),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: PathBuf::from("a.out"),
            instructions,
        }
    }

    #[test]
    fn two_objects_then_link() {
        let r = recipe(
            &["main.c", "helper.c"],
            vec![
                Instruction::PushInput {
                    file: "main.c".into(),
                },
                Instruction::CompileObj { npop: 1 },
                Instruction::PushInput {
                    file: "helper.c".into(),
                },
                Instruction::CompileObj { npop: 1 },
                Instruction::CompileExe { npop: 2 },
            ],
        );
        let driver = RecordingCompiler::default();
        let mut it = Interpreter::new(Some(&driver), &r, None);
        it.interpret(&NeverCancelled).unwrap();

        assert_eq!(it.pc(), 5);
        assert_eq!(it.stack_len(), 0, "binary is terminal, stack must drain");

        let calls = driver.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].2, PathBuf::from("/work/s/obj_0.o"));
        assert_eq!(calls[1].2, PathBuf::from("/work/s/obj_1.o"));
        assert_eq!(calls[2].2, PathBuf::from("/work/s/a.out"));
        // Link inputs are popped LIFO: newest object first.
        assert_eq!(
            calls[2].1,
            vec![
                PathBuf::from("/work/s/obj_1.o"),
                PathBuf::from("/work/s/obj_0.o")
            ]
        );
    }

    #[test]
    fn push_consumed_input_is_unavailable() {
        let r = recipe(
            &["main.c"],
            vec![
                Instruction::PushInput {
                    file: "main.c".into(),
                },
                Instruction::PushInput {
                    file: "main.c".into(),
                },
            ],
        );
        let driver = RecordingCompiler::default();
        let mut it = Interpreter::new(Some(&driver), &r, None);
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::FileUnavailable);
    }

    #[test]
    fn push_undeclared_input_is_unavailable() {
        let r = recipe(
            &["main.c"],
            vec![Instruction::PushInput {
                file: "ghost.c".into(),
            }],
        );
        let mut it = Interpreter::new(None, &r, None);
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::FileUnavailable);
    }

    #[test]
    fn push_inputs_filters_by_kind_in_name_order() {
        let r = recipe(
            &["z.c", "a.c", "defs.h"],
            vec![
                Instruction::PushInputs {
                    kind: crate::FileKind::CSource,
                },
                Instruction::CompileExe { npop: 0 },
            ],
        );
        let driver = RecordingCompiler::default();
        let mut it = Interpreter::new(Some(&driver), &r, None);
        it.interpret(&NeverCancelled).unwrap();

        let calls = driver.calls.lock().unwrap();
        // Pushed a.c then z.c; popped LIFO, so z.c leads.
        assert_eq!(
            calls[0].1,
            vec![PathBuf::from("/work/s/z.c"), PathBuf::from("/work/s/a.c")]
        );
    }

    #[test]
    fn obj_overflow_at_cap_does_not_advance_counter() {
        let r = recipe(
            &["main.c"],
            vec![
                Instruction::PushInput {
                    file: "main.c".into(),
                },
                Instruction::CompileObj { npop: 1 },
                Instruction::CompileObj { npop: 0 },
            ],
        );
        let driver = RecordingCompiler::default();
        let mut it = Interpreter::new(Some(&driver), &r, Some(1));
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::ObjOverflow);
        // Only the first compile ran; the cap check precedes the driver.
        assert_eq!(driver.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn bad_op_is_rejected() {
        let r = recipe(&[], vec![Instruction::Unknown]);
        let mut it = Interpreter::new(None, &r, None);
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::BadOp);
    }

    #[test]
    fn missing_driver_is_nil_compiler() {
        let r = recipe(&[], vec![Instruction::CompileExe { npop: 0 }]);
        let mut it = Interpreter::new(None, &r, None);
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::NilCompiler);
    }

    #[test]
    fn driver_failure_propagates_as_compiler_kind() {
        let r = recipe(
            &["main.c"],
            vec![
                Instruction::PushInput {
                    file: "main.c".into(),
                },
                Instruction::CompileObj { npop: 1 },
            ],
        );
        let driver = RecordingCompiler {
            fail_with: Some("exit status 1".to_string()),
            ..Default::default()
        };
        let mut it = Interpreter::new(Some(&driver), &r, None);
        let err = it.interpret(&NeverCancelled).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::Compiler);
        assert!(err.message.contains("exit status 1"));
    }

    #[test]
    fn interpret_resumes_from_stored_pc() {
        struct CancelOnce(std::sync::atomic::AtomicUsize);
        impl Cancellation for CancelOnce {
            fn is_cancelled(&self) -> bool {
                // Fires on the third poll only.
                self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed) == 2
            }
        }

        let r = recipe(
            &["main.c"],
            vec![
                Instruction::Nop,
                Instruction::Nop,
                Instruction::PushInput {
                    file: "main.c".into(),
                },
                Instruction::CompileExe { npop: 1 },
            ],
        );
        let driver = RecordingCompiler::default();
        let mut it = Interpreter::new(Some(&driver), &r, None);

        let cancel = CancelOnce(std::sync::atomic::AtomicUsize::new(0));
        let err = it.interpret(&cancel).unwrap_err();
        assert_eq!(err.kind, InterpErrorKind::Cancelled);
        assert_eq!(it.pc(), 2);

        it.interpret(&NeverCancelled).unwrap();
        assert_eq!(it.pc(), 4);
        assert_eq!(driver.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn pop_all_when_n_nonpositive_or_too_large() {
        let r = recipe(&["a.c", "b.c"], Vec::new());
        let mut it = Interpreter::new(None, &r, None);
        it.push_input("a.c").unwrap();
        it.push_input("b.c").unwrap();
        assert_eq!(it.pop_stack(-1).len(), 2);

        let mut it = Interpreter::new(None, &r, None);
        it.push_input("a.c").unwrap();
        it.push_input("b.c").unwrap();
        assert_eq!(it.pop_stack(99).len(), 2);

        let mut it = Interpreter::new(None, &r, None);
        it.push_input("a.c").unwrap();
        it.push_input("b.c").unwrap();
        let top = it.pop_stack(1);
        assert_eq!(top, vec![PathBuf::from("/work/s/b.c")]);
        assert_eq!(it.stack_len(), 1);
    }
}
