pub mod compiled;
pub(crate) mod compiler;
pub(crate) mod deserializer;
pub(crate) mod name;
pub(crate) mod tokens;
pub(crate) mod value_variant;

#[cfg(test)]
pub(crate) mod test_support;
