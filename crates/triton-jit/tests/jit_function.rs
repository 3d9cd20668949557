use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use triton_jit::{
    pack_arguments, ArgDescriptor, ArgKind, ArgType, ArgValue, Backend, CompileRequest, DType,
    Dim3, JitFunction, JitRegistry, KernelArgs, KernelCompiler, KernelError, KernelMetadata,
    KernelResult, LaunchConfig, LaunchRequest, StaticSignature, TensorArg,
};
use triton_jit::parse_signature;

#[derive(Debug, Clone)]
struct RecordedLaunch {
    kernel: String,
    stream: u64,
    grid: Dim3,
    block: Dim3,
    shared_memory_bytes: u32,
    signature: Option<String>,
    layout_len: Option<usize>,
    args: Vec<[u8; 8]>,
}

#[derive(Default)]
struct RecordingBackend {
    device: AtomicI32,
    loads: AtomicUsize,
    contexts: AtomicUsize,
    with_layout: bool,
    launches: Mutex<Vec<RecordedLaunch>>,
}

impl RecordingBackend {
    fn launches(&self) -> Vec<RecordedLaunch> {
        self.launches.lock().unwrap().clone()
    }
}

impl Backend for RecordingBackend {
    type Stream = u64;
    type Context = ();
    type Kernel = String;

    const NAME: &'static str = "recording";
    const VERSION: &'static str = "test";
    const WARP_SIZE: u32 = 32;

    fn wants_arg_layout(&self) -> bool {
        self.with_layout
    }

    fn ensure_context(&self) -> KernelResult<()> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn device_index(&self) -> KernelResult<i32> {
        Ok(self.device.load(Ordering::SeqCst))
    }

    fn load_kernel(&self, dir: &Path, kernel_name: &str) -> KernelResult<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}::{kernel_name}", dir.display()))
    }

    fn shared_memory(&self, _dir: &Path, _kernel_name: &str) -> KernelResult<u32> {
        Ok(4096)
    }

    fn kernel_metadata(
        &self,
        _dir: &Path,
        _kernel_name: &str,
    ) -> KernelResult<Option<Arc<KernelMetadata>>> {
        Ok(Some(Arc::new(KernelMetadata {
            arg_layout: Some(vec![
                ArgDescriptor::new(ArgKind::Pointer),
                ArgDescriptor::new(ArgKind::Int64),
            ]),
            ..KernelMetadata::default()
        })))
    }

    fn launch(&self, stream: u64, request: LaunchRequest<'_, String>) -> KernelResult<()> {
        let args = (0..request.args.len())
            .map(|index| request.args.read(index, 8).unwrap_or([0; 8]))
            .collect();
        self.launches.lock().unwrap().push(RecordedLaunch {
            kernel: request.kernel.clone(),
            stream,
            grid: request.grid,
            block: request.block,
            shared_memory_bytes: request.shared_memory_bytes,
            signature: request.signature.map(str::to_string),
            layout_len: request.arg_layout.map(<[ArgDescriptor]>::len),
            args,
        });
        Ok(())
    }
}

struct CountingCompiler {
    static_signature: Vec<i64>,
    signatures: AtomicUsize,
    compiles: Mutex<Vec<(String, u32, u32, i32)>>,
}

impl CountingCompiler {
    fn new(codes: &[i64]) -> Self {
        Self {
            static_signature: codes.to_vec(),
            signatures: AtomicUsize::new(0),
            compiles: Mutex::new(Vec::new()),
        }
    }

    fn compile_count(&self) -> usize {
        self.compiles.lock().unwrap().len()
    }
}

impl KernelCompiler for CountingCompiler {
    fn extract_signature(&self, _file: &Path, _function: &str) -> KernelResult<StaticSignature> {
        self.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(StaticSignature::from_codes(&self.static_signature))
    }

    fn compile(&self, request: &CompileRequest<'_>) -> KernelResult<PathBuf> {
        let mut compiles = self.compiles.lock().unwrap();
        compiles.push((
            request.signature.to_string(),
            request.num_warps,
            request.num_stages,
            request.device_index,
        ));
        Ok(PathBuf::from(format!("/cache/{}", compiles.len())))
    }
}

const X: u64 = 0x7f00_0000_1000;
const Y: u64 = 0x7f00_0008_1000;
const OUT: u64 = 0x7f00_0010_1000;

fn add_args(n: i64) -> Vec<ArgValue> {
    vec![
        TensorArg::new(X, DType::F32).into(),
        TensorArg::new(Y, DType::F32).into(),
        TensorArg::new(OUT, DType::F32).into(),
        n.into(),
        1024i64.into(),
    ]
}

fn add_function(
    backend: RecordingBackend,
) -> (Arc<RecordingBackend>, Arc<CountingCompiler>, JitFunction<RecordingBackend>) {
    let backend = Arc::new(backend);
    let compiler = Arc::new(CountingCompiler::new(&[1, 1, 1, 1, 2]));
    let function = JitFunction::new(
        Arc::clone(&backend),
        compiler.clone(),
        "kernels/add.py",
        "add_kernel",
    )
    .expect("static signature");
    (backend, compiler, function)
}

#[test]
fn add_kernel_launches_and_reuses_overload() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (backend, compiler, function) = add_function(RecordingBackend::default());
    let n = 131_072i64;
    let config = LaunchConfig::new(Dim3::linear((n as u32).div_ceil(1024)), 8, 3);

    function.call(7, &config, &add_args(n))?;
    function.call(7, &config, &add_args(n))?;

    assert_eq!(compiler.compile_count(), 1);
    assert_eq!(
        compiler.compiles.lock().unwrap()[0],
        ("*fp32:16,*fp32:16,*fp32:16,i64:16,1024".to_string(), 8, 3, 0)
    );
    assert_eq!(function.overload_count()?, 1);
    assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    assert_eq!(backend.contexts.load(Ordering::SeqCst), 2);

    let launches = backend.launches();
    assert_eq!(launches.len(), 2);
    let launch = &launches[0];
    assert_eq!(launch.kernel, "/cache/1::add_kernel");
    assert_eq!(launch.stream, 7);
    assert_eq!(launch.grid, Dim3::new(128, 1, 1));
    assert_eq!(launch.block, Dim3::new(256, 1, 1));
    assert_eq!(launch.shared_memory_bytes, 4096);
    assert_eq!(
        launch.signature.as_deref(),
        Some("*fp32:16,*fp32:16,*fp32:16,i64:16,1024")
    );
    assert_eq!(launch.layout_len, None);
    assert_eq!(
        launch.args,
        vec![
            X.to_ne_bytes(),
            Y.to_ne_bytes(),
            OUT.to_ne_bytes(),
            n.to_ne_bytes(),
            [0; 8],
        ]
    );
    Ok(())
}

#[test]
fn new_device_or_signature_compiles_new_overload() -> Result<()> {
    let (backend, compiler, function) = add_function(RecordingBackend::default());
    let config = LaunchConfig::new(Dim3::linear(1), 4, 2);

    function.call(0, &config, &add_args(4096))?;
    function.call(0, &config, &add_args(1000))?;
    backend.device.store(1, Ordering::SeqCst);
    function.call(0, &config, &add_args(4096))?;

    assert_eq!(compiler.compile_count(), 3);
    let compiles = compiler.compiles.lock().unwrap().clone();
    assert_eq!(compiles[1].0, "*fp32:16,*fp32:16,*fp32:16,i64,1024");
    assert_eq!(compiles[2].3, 1);
    assert_eq!(function.overload_count()?, 3);
    Ok(())
}

#[test]
fn concurrent_calls_compile_once() {
    let (_backend, compiler, function) = add_function(RecordingBackend::default());
    let function = Arc::new(function);
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let function = Arc::clone(&function);
            thread::spawn(move || {
                let config = LaunchConfig::new(Dim3::linear(4), 4, 3);
                function.call(0, &config, &add_args(4096))
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked").expect("call");
    }
    assert_eq!(compiler.compile_count(), 1);
}

#[test]
fn layout_aware_backends_receive_metadata_layout() -> Result<()> {
    let (backend, _compiler, function) = add_function(RecordingBackend {
        with_layout: true,
        ..RecordingBackend::default()
    });
    function.call(0, &LaunchConfig::default(), &add_args(64))?;
    assert_eq!(backend.launches()[0].layout_len, Some(2));
    Ok(())
}

fn ssig(codes: &[i64]) -> StaticSignature {
    StaticSignature::from_codes(codes)
}

#[test]
fn absent_arguments_emit_nullopt_without_bytes() -> Result<()> {
    let packed = pack_arguments(
        &ssig(&[0, 0, 0]),
        &[
            TensorArg::new(0x1000, DType::F16).into(),
            Option::<TensorArg>::None.into(),
            3i32.into(),
        ],
    )?;
    assert_eq!(packed.signature, "*fp16,nullopt,i32");
    // pointer, i32 and the trailing scratch pointer
    assert_eq!(packed.buffer.arg_count(), 3);
    assert_eq!(packed.buffer.offsets().collect::<Vec<_>>(), vec![0, 8, 16]);
    Ok(())
}

#[test]
fn specialization_suffixes() -> Result<()> {
    let packed = pack_arguments(
        &ssig(&[1, 1, 1, 1, 1, 1]),
        &[
            TensorArg::new(0x1008, DType::BF16).into(),
            1i64.into(),
            32u32.into(),
            7i32.into(),
            0.5f32.into(),
            true.into(),
        ],
    )?;
    assert_eq!(packed.signature, "*bf16,i64:1,u32:16,i32,fp32,i1:1");
    // the `:1` values carry no bytes
    assert_eq!(packed.buffer.arg_count(), 5);
    assert_eq!(packed.buffer.slot(1), Some(&32u32.to_ne_bytes()[..]));
    Ok(())
}

#[test]
fn specialized_one_is_elided_from_buffer() -> Result<()> {
    let packed = pack_arguments(&ssig(&[1, 0]), &[1i64.into(), 2i64.into()])?;
    assert_eq!(packed.signature, "i64:1,i64");
    assert_eq!(packed.buffer.arg_count(), 2);
    assert_eq!(packed.buffer.slot(0), Some(&2i64.to_ne_bytes()[..]));
    Ok(())
}

#[test]
fn constexpr_values_only_emit_tokens() -> Result<()> {
    let packed = pack_arguments(
        &ssig(&[2, 2, 2, 2]),
        &[64i64.into(), true.into(), 2.0f64.into(), (-3i32).into()],
    )?;
    assert_eq!(packed.signature, "64,true,2.0,-3");
    assert_eq!(packed.buffer.arg_count(), 1);
    Ok(())
}

#[test]
fn packed_signature_parses_to_pushed_arguments() -> Result<()> {
    let packed = pack_arguments(
        &ssig(&[1, 2, 2, 2, 2, 1, 1, 0, 0, 0, 1, 0]),
        &[
            TensorArg::new(0x1000, DType::F16).into(),
            128i64.into(),
            true.into(),
            0.5f32.into(),
            f64::NEG_INFINITY.into(),
            1i32.into(),
            48u64.into(),
            ArgValue::None,
            false.into(),
            7i32.into(),
            true.into(),
            2.0f64.into(),
        ],
    )?;
    assert_eq!(
        packed.signature,
        "*fp16:16,128,true,0.5,-inf,i32:1,u64:16,nullopt,i1,i32,i1:1,fp64"
    );
    let layout = parse_signature(&packed.signature);
    // trailing scratch pointer has no token
    assert_eq!(layout.len() + 1, packed.buffer.arg_count());
    for (index, descriptor) in layout.iter().enumerate() {
        let slot = packed.buffer.slot(index).expect("slot for every descriptor");
        assert_eq!(slot.len(), descriptor.size, "argument {index}");
    }
    Ok(())
}

#[test]
fn runtime_bools_fill_an_i32_slot() -> Result<()> {
    let packed = pack_arguments(&ssig(&[0, 0]), &[false.into(), true.into()])?;
    assert_eq!(packed.signature, "i1,i1");
    assert_eq!(packed.buffer.offsets().collect::<Vec<_>>(), vec![0, 4, 8]);
    assert_eq!(packed.buffer.slot(0), Some(&0i32.to_ne_bytes()[..]));
    assert_eq!(packed.buffer.slot(1), Some(&1i32.to_ne_bytes()[..]));
    let args = KernelArgs::packed(&packed.buffer);
    assert_eq!(args.read(0, 4), Some([0; 8]));
    Ok(())
}

#[test]
fn tensor_marked_constexpr_is_rejected() {
    let err = pack_arguments(&ssig(&[2]), &[TensorArg::new(0x10, DType::F32).into()]).unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
}

#[test]
fn too_many_arguments_is_rejected() {
    let err = pack_arguments(&ssig(&[0]), &[1i32.into(), 2i32.into()]).unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
}

#[test]
fn static_signature_codes() {
    let signature = StaticSignature::from_codes(&[0, 1, 2, 9]);
    assert_eq!(signature.num_args(), 4);
    assert_eq!(
        signature.arg_types(),
        &[
            ArgType::NonConstexpr,
            ArgType::Specialized,
            ArgType::Constexpr,
            ArgType::NonConstexpr,
        ]
    );
    assert!(signature.at(4).is_err());
}

#[test]
fn raw_arguments_bypass_packing() -> Result<()> {
    let (backend, compiler, function) = add_function(RecordingBackend::default());
    let mut x = X;
    let mut n = 77i64;
    let mut scratch = 0u64;
    let raw: [*mut c_void; 3] = [
        &mut x as *mut u64 as *mut c_void,
        &mut n as *mut i64 as *mut c_void,
        &mut scratch as *mut u64 as *mut c_void,
    ];
    // SAFETY: every pointer references a live 8-byte local.
    unsafe {
        function.launch_with_raw_args(9, &LaunchConfig::default(), "*fp32:16,i64,128", &raw)?;
    }
    assert_eq!(compiler.compiles.lock().unwrap()[0].0, "*fp32:16,i64,128");
    let launch = &backend.launches()[0];
    assert_eq!(launch.args[0], X.to_ne_bytes());
    assert_eq!(launch.args[1], 77i64.to_ne_bytes());
    assert_eq!(launch.block, Dim3::linear(128));
    Ok(())
}

#[test]
fn registry_returns_one_function_per_pair() -> Result<()> {
    let backend = Arc::new(RecordingBackend::default());
    let compiler = Arc::new(CountingCompiler::new(&[0]));
    let registry = JitRegistry::new(backend, compiler.clone());

    let first = registry.get_or_create("kernels/add.py", "add_kernel")?;
    let again = registry.get_or_create("kernels/add.py", "add_kernel")?;
    let other = registry.get_or_create("kernels/add.py", "sub_kernel")?;

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(registry.len()?, 2);
    assert_eq!(compiler.signatures.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn kernel_args_raw_null_reads_as_absent() {
    let raw: [*mut c_void; 1] = [std::ptr::null_mut()];
    // SAFETY: null entries are never dereferenced.
    let args = unsafe { KernelArgs::from_raw(&raw) };
    assert_eq!(args.len(), 1);
    assert_eq!(args.read(0, 8), None);
    assert_eq!(args.read(1, 8), None);
}
