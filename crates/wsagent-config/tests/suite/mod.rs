mod discovery;
mod tracing_init;
