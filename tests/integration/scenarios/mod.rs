mod evacuation_tests;
mod fault_shim_tests;
mod task_tests;
