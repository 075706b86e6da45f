/// Builds a positional argument list; each element goes through `Arg::from`.
///
/// ```ignore
/// let out = tracer.root().call(args![&x, RefValue::Int(2)], kwargs! {})?;
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::graph::Arg::from($arg)),*]
    };
}

/// Builds keyword arguments: `kwargs! { "dim" => RefValue::from(0) }`.
#[macro_export]
macro_rules! kwargs {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut tmp = $crate::value::Kwargs::new();
        $(tmp.insert(::std::string::String::from($key), $crate::graph::Arg::from($value));)*
        tmp
    }};
}
