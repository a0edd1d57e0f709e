// This file is generated by `cargo hakari`. To regenerate, run `cargo hakari generate`.
