/// Native module runs subjects as real OS processes through tokio.
pub mod runner;
