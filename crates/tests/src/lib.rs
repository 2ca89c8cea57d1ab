pub mod fixtures;

#[cfg(test)]
mod coordinator_tests;
#[cfg(test)]
mod scenario_tests;
