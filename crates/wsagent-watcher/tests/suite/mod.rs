mod manual;
mod support;
