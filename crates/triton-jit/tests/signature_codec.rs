use triton_jit::signature::{is_literal_constant, is_numeric_constant, parse_layout_type};
use triton_jit::{parse_signature, parse_signature_with, ArgKind, KernelError, TypePolicy};

fn kinds(signature: &str) -> Vec<ArgKind> {
    parse_signature(signature)
        .into_iter()
        .map(|descriptor| descriptor.kind)
        .collect()
}

#[test]
fn constants_and_nullopt_are_dropped() {
    assert_eq!(
        kinds("*fp32:16,*fp32,i64,1024,nullopt"),
        vec![ArgKind::Pointer, ArgKind::Pointer, ArgKind::Int64]
    );
}

#[test]
fn boolean_and_non_finite_constants_are_dropped() -> Result<(), KernelError> {
    for literal in ["true", "false", "NaN", "inf", "-inf"] {
        assert!(is_literal_constant(literal), "{literal}");
    }
    assert!(!is_literal_constant("i1"));
    let layout = parse_signature_with("*fp32,true,NaN,-inf,false,i32", TypePolicy::Strict)?;
    let kinds: Vec<ArgKind> = layout.iter().map(|descriptor| descriptor.kind).collect();
    assert_eq!(kinds, vec![ArgKind::Pointer, ArgKind::Int32]);
    Ok(())
}

#[test]
fn descriptors_carry_size_and_alignment() {
    let layout = parse_signature("*i8,i32,fp64,f32,u64");
    let shape: Vec<(ArgKind, usize, usize)> = layout
        .iter()
        .map(|descriptor| (descriptor.kind, descriptor.size, descriptor.align))
        .collect();
    assert_eq!(
        shape,
        vec![
            (ArgKind::Pointer, 8, 8),
            (ArgKind::Int32, 4, 4),
            (ArgKind::Float64, 8, 8),
            (ArgKind::Float32, 4, 4),
            (ArgKind::Int64, 8, 8),
        ]
    );
}

#[test]
fn unknown_tokens_default_to_int64() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert_eq!(kinds("q8"), vec![ArgKind::Int64]);
    assert_eq!(kinds("*fp32,q8:16"), vec![ArgKind::Pointer, ArgKind::Int64]);
}

#[test]
fn strict_policy_rejects_unknown_tokens() {
    let err = parse_signature_with("*fp32,q8", TypePolicy::Strict).unwrap_err();
    match err {
        KernelError::UnsupportedType { token } => assert_eq!(token, "q8"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn tokens_are_trimmed() {
    assert_eq!(
        kinds("  *fp16 , i32:16 ,  64 , nullopt ,"),
        vec![ArgKind::Pointer, ArgKind::Int32]
    );
}

#[test]
fn negative_literals_are_constants() {
    assert!(is_numeric_constant("-3"));
    assert!(is_numeric_constant("0.5"));
    assert!(!is_numeric_constant("-"));
    assert!(!is_numeric_constant("-x"));
    assert!(!is_numeric_constant("i32"));
    assert_eq!(kinds("-1,i64"), vec![ArgKind::Int64]);
}

#[test]
fn scalars_specialized_to_one_carry_no_argument() {
    assert_eq!(
        kinds("*fp32:16,i64:1,i32:16,i32"),
        vec![ArgKind::Pointer, ArgKind::Int32, ArgKind::Int32]
    );
}

#[test]
fn half_precision_scalars_are_promoted() {
    assert_eq!(
        kinds("fp16,bf16,f16"),
        vec![ArgKind::Float32, ArgKind::Float32, ArgKind::Float32]
    );
}

#[test]
fn booleans_travel_as_int32() {
    assert_eq!(kinds("i1"), vec![ArgKind::Int32]);
}

#[test]
fn layout_types_cover_metadata_names() {
    let policy = TypePolicy::Lenient;
    for (name, kind) in [
        ("ptr", ArgKind::Pointer),
        ("pointer", ArgKind::Pointer),
        ("i32", ArgKind::Int32),
        ("u32", ArgKind::Int32),
        ("i64", ArgKind::Int64),
        ("u64", ArgKind::Int64),
        ("f32", ArgKind::Float32),
        ("fp32", ArgKind::Float32),
        ("f64", ArgKind::Float64),
        ("fp64", ArgKind::Float64),
    ] {
        let descriptor = parse_layout_type(name, policy)
            .expect("known layout type")
            .expect("runtime argument");
        assert_eq!(descriptor.kind, kind, "layout type {name}");
    }
    assert_eq!(parse_layout_type("constexpr", policy).unwrap(), None);
    assert!(parse_layout_type("tensor", TypePolicy::Strict).is_err());
}
