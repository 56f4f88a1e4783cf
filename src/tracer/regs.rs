//! Register-file accessors for the traced architecture (x86_64).
//!
//! The syscall number lives in `rax` (`orig_rax` once the kernel has
//! consumed it), the result in `rax` at exit, and arguments in
//! `rdi, rsi, rdx, r10, r8, r9`.

#[derive(Copy, Clone)]
pub struct Registers {
    u: libc::user_regs_struct,
}

impl Registers {
    pub fn from_raw(u: libc::user_regs_struct) -> Registers {
        Registers { u }
    }

    pub fn raw(&self) -> libc::user_regs_struct {
        self.u
    }

    pub fn zeroed() -> Registers {
        Registers {
            u: unsafe { std::mem::zeroed() },
        }
    }

    /// The outstanding syscall number at a syscall stop.
    pub fn syscallno(&self) -> i64 {
        self.u.orig_rax as i64
    }

    pub fn set_syscallno(&mut self, no: i64) {
        self.u.orig_rax = no as u64;
    }

    /// Load the number register, as the displaced load instruction would.
    pub fn emulate_number_load(&mut self, no: i64) {
        self.u.rax = no as u64;
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.u.rax as i64
    }

    pub fn ip(&self) -> u64 {
        self.u.rip
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.u.rip = ip;
    }

    /// Syscall argument by position, following the kernel calling
    /// convention.
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.u.rdi,
            1 => self.u.rsi,
            2 => self.u.rdx,
            3 => self.u.r10,
            4 => self.u.r8,
            _ => self.u.r9,
        }
    }

    pub fn set_arg(&mut self, n: usize, v: u64) {
        match n {
            0 => self.u.rdi = v,
            1 => self.u.rsi = v,
            2 => self.u.rdx = v,
            3 => self.u.r10 = v,
            4 => self.u.r8 = v,
            _ => self.u.r9 = v,
        }
    }
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Registers {{ rip: {:#x}, orig_rax: {}, rax: {:#x} }}",
            self.u.rip, self.u.orig_rax as i64, self.u.rax
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_kernel_convention() {
        let mut r = Registers::zeroed();
        for i in 0..6 {
            r.set_arg(i, (i as u64 + 1) * 10);
        }
        assert_eq!(
            (0..6).map(|i| r.arg(i)).collect::<Vec<_>>(),
            vec![10, 20, 30, 40, 50, 60]
        );
    }

    #[test]
    fn number_load_emulation_touches_rax_only() {
        let mut r = Registers::zeroed();
        r.set_ip(0x1000);
        r.emulate_number_load(87);
        assert_eq!(r.syscall_result_signed(), 87);
        assert_eq!(r.ip(), 0x1000);
    }
}
