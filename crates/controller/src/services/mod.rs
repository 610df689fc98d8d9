pub mod links;
pub mod overlay;
pub mod reservations;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_support;
